//! The push-side sync core.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use super::config::{BroadcastConfig, BroadcastMetrics};
use super::queue::{coalesce, Drained, PendingEvent, PendingQueue};
use crate::binding::{run_persist, BindingRegistry, PersistHook, WriteOutcome};
use crate::observable::Subscription;
use crate::protocol::{Codec, CodecError, DeltaPacket, Entry, Envelope, JsonCodec};
use crate::replay::ReplayHub;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::session::{SessionId, SessionSet, SessionSink};
use crate::watch::{ChangeHandler, RegistryWatch};

/// Builds the full-state envelope of a registry. Keys whose value cannot be
/// serialized are logged and left out.
pub(crate) fn snapshot_entries(registry: &BindingRegistry) -> Vec<Entry> {
    registry
        .iter()
        .filter_map(|(key, binding)| match binding.snapshot() {
            Ok(value) => Some(Entry::snapshot(key, value)),
            Err(e) => {
                tracing::error!(key, "skipping unserializable value in snapshot: {e}");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`BroadcastCore`].
pub struct BroadcastCoreBuilder {
    registry: BindingRegistry,
    codec: Option<Arc<dyn Codec>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    config: Option<BroadcastConfig>,
    persist: Option<PersistHook>,
    source: Option<ReplayHub>,
}

impl BroadcastCoreBuilder {
    /// Sets the envelope codec. Defaults to [`JsonCodec`].
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Sets the scheduler running debounced flushes. Defaults to the tokio
    /// runtime of the calling context.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the broadcast configuration.
    #[must_use]
    pub fn config(mut self, config: BroadcastConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets a hook run after every inbound write that changed state.
    #[must_use]
    pub fn persist(mut self, hook: PersistHook) -> Self {
        self.persist = Some(hook);
        self
    }

    /// Feeds the core from `hub` instead of watching the registry directly.
    ///
    /// Envelopes then carry the hub's sequence numbers, so a client can
    /// reconnect through [`BroadcastCore::on_open`] with the last sequence it
    /// saw. The hub must serve the same bindings as the core's registry.
    #[must_use]
    pub fn replay(mut self, hub: ReplayHub) -> Self {
        self.source = Some(hub);
        self
    }

    /// Builds the core. Bindings are subscribed when the first session
    /// opens.
    ///
    /// Without an explicit scheduler and outside a tokio runtime, a buffered
    /// configuration falls back to immediate sends.
    #[must_use]
    pub fn build(self) -> BroadcastCore {
        let mut config = self.config.unwrap_or_default();
        let scheduler: Option<Arc<dyn Scheduler>> = match self.scheduler {
            Some(s) => Some(s),
            None => TokioScheduler::try_current().map(|s| Arc::new(s) as Arc<dyn Scheduler>),
        };
        if scheduler.is_none() && config.backpressure_enabled {
            tracing::warn!("no scheduler available, broadcasting changes immediately");
            config.backpressure_enabled = false;
        }

        let inner = Arc::new_cyclic(|me| CoreInner {
            me: me.clone(),
            queue: Mutex::new(PendingQueue::new(config.effective_queue_depth())),
            registry: self.registry,
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            scheduler,
            config,
            persist: self.persist,
            source: self.source,
            sessions: SessionSet::new(),
            flush_lock: Mutex::new(()),
            flush_scheduled: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            watch: Mutex::new(None),
            metrics: BroadcastMetrics::default(),
        });
        BroadcastCore { inner }
    }
}

// ---------------------------------------------------------------------------
// BroadcastCore
// ---------------------------------------------------------------------------

/// Encodes state changes of one registry and fans them out to its sessions.
///
/// With backpressure disabled every change is sent synchronously as a
/// one-entry envelope. With backpressure enabled changes are queued and one
/// flush per `flush_interval` window sends a coalesced envelope.
///
/// The core subscribes on the first [`on_open`](Self::on_open). When the last
/// session closes it drops its queue and every listener; the next open
/// subscribes again.
///
/// ```text
/// lock order: watch ─► hub state ─► hub emit ─► flush ─► queue
/// ```
#[derive(Clone)]
pub struct BroadcastCore {
    inner: Arc<CoreInner>,
}

enum Attachment {
    Registry(RegistryWatch),
    Replay(Subscription),
}

impl Attachment {
    fn release(self) {
        match self {
            Self::Registry(watch) => watch.release(),
            Self::Replay(mut feed) => feed.unsubscribe(),
        }
    }
}

struct CoreInner {
    me: Weak<CoreInner>,
    registry: BindingRegistry,
    codec: Arc<dyn Codec>,
    scheduler: Option<Arc<dyn Scheduler>>,
    config: BroadcastConfig,
    persist: Option<PersistHook>,
    source: Option<ReplayHub>,
    sessions: SessionSet,
    queue: Mutex<PendingQueue>,
    /// Held across drain, encode and fan-out, so envelopes leave in
    /// sequence order.
    flush_lock: Mutex<()>,
    flush_scheduled: AtomicBool,
    seq: AtomicU64,
    /// Also serializes session open/close against each other.
    watch: Mutex<Option<Attachment>>,
    metrics: BroadcastMetrics,
}

impl BroadcastCore {
    /// Starts building a core over `registry`.
    #[must_use]
    pub fn builder(registry: BindingRegistry) -> BroadcastCoreBuilder {
        BroadcastCoreBuilder {
            registry,
            codec: None,
            scheduler: None,
            config: None,
            persist: None,
            source: None,
        }
    }

    /// Attaches a session.
    ///
    /// With a replay hub and `since > 0`, the session receives only what the
    /// hub recorded after `since`; if the hub has nothing newer (or no hub is
    /// given) it receives a full snapshot of every bound key. A core built
    /// with [`replay`](BroadcastCoreBuilder::replay) always recovers from its
    /// own hub.
    ///
    /// Events still queued for the sessions already attached are flushed to
    /// them first, so the new session's stream starts exactly at the
    /// envelope it receives here.
    ///
    /// # Errors
    ///
    /// Returns an encode error, or the send error after which the session
    /// was not added.
    pub fn on_open(
        &self,
        sink: Arc<dyn SessionSink>,
        replay: Option<&ReplayHub>,
        since: u64,
    ) -> crate::Result<()> {
        let inner = &self.inner;
        let id = sink.id();
        let mut watch = inner.watch.lock();
        inner.attach(&mut watch);

        let opened = match (&inner.source, replay) {
            (Some(source), _) => {
                if replay.is_some_and(|hub| !hub.ptr_eq(source)) {
                    tracing::warn!(session = %id, "recovering from the core's own replay hub");
                }
                source.with_poll(since, |polled| {
                    inner.admit(sink, |inner| inner.recovered_or_snapshot(id, since, polled))
                })
            }
            (None, Some(hub)) if since > 0 => {
                let polled = hub.poll(since);
                // The session continues after the hub's sequence.
                inner.seq.fetch_max(polled.seq, Ordering::AcqRel);
                inner.admit(sink, |inner| {
                    if polled.is_empty() {
                        Envelope::new(inner.next_seq(), snapshot_entries(&inner.registry))
                    } else {
                        tracing::info!(session = %id, "Recovered {} messages", polled.batch.len());
                        polled
                    }
                })
            }
            (None, _) => inner.admit(sink, |inner| {
                Envelope::new(inner.next_seq(), snapshot_entries(&inner.registry))
            }),
        };

        if opened.is_err() && inner.sessions.is_empty() {
            inner.release(&mut watch);
        } else if opened.is_ok() {
            tracing::debug!(session = %id, since, "session opened");
        }
        opened
    }

    /// Applies a client `{k, v}` message.
    ///
    /// A registered key is assigned; a dotted key is written into the
    /// nearest structured ancestor only if the member's value differs. The
    /// persistence hook runs when state changed.
    ///
    /// # Errors
    ///
    /// Returns a decode error or the [`WriteError`](crate::binding::WriteError)
    /// of the rejected write. Nothing is broadcast in either case.
    pub fn on_message(&self, session: SessionId, text: &str) -> crate::Result<WriteOutcome> {
        let inner = &self.inner;
        let incoming = inner.codec.decode(text).inspect_err(|e| {
            tracing::warn!(session = %session, "dropping malformed message: {e}");
        })?;
        match inner.registry.write(&incoming.k, &incoming.v) {
            Ok(outcome) => {
                if outcome.changed() {
                    run_persist(inner.persist.as_ref(), &inner.registry, &incoming.k);
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(session = %session, key = %incoming.k, "write rejected: {e}");
                Err(e.into())
            }
        }
    }

    /// Detaches a session. The last detach drops queued events and every
    /// subscription of the core.
    pub fn on_close(&self, session: SessionId) {
        let inner = &self.inner;
        let mut watch = inner.watch.lock();
        inner.sessions.remove(session);
        tracing::debug!(session = %session, "session closed");
        if inner.sessions.is_empty() && watch.is_some() {
            inner.release(&mut watch);
            tracing::debug!("last session closed, core released");
        }
    }

    /// Closes every session and releases the core.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut watch = inner.watch.lock();
        inner.sessions.close_all();
        inner.release(&mut watch);
    }

    /// Runs a flush now instead of waiting for the scheduled one.
    pub fn flush_now(&self) {
        self.inner.flush();
    }

    /// Returns the core's metrics.
    #[must_use]
    pub fn metrics(&self) -> &BroadcastMetrics {
        &self.inner.metrics
    }

    /// Returns the effective configuration.
    #[must_use]
    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    /// Returns the registry this core serves.
    #[must_use]
    pub fn registry(&self) -> &BindingRegistry {
        &self.inner.registry
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Sequence number of the last envelope produced.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.inner.seq.load(Ordering::Acquire)
    }

    /// Number of events waiting for the next flush.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Returns `true` while the core is subscribed to its bindings.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.watch.lock().is_some()
    }
}

impl fmt::Debug for BroadcastCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastCore")
            .field("keys", &self.inner.registry.len())
            .field("sessions", &self.inner.sessions.len())
            .field("seq", &self.current_sequence())
            .field("replay", &self.inner.source.is_some())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CoreInner
// ---------------------------------------------------------------------------

impl CoreInner {
    fn attach(&self, slot: &mut Option<Attachment>) {
        if slot.is_some() {
            return;
        }
        *slot = Some(match &self.source {
            Some(hub) => {
                let weak = self.me.clone();
                Attachment::Replay(hub.feed(Arc::new(move |seq: u64, entry: &Entry| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_sequenced(seq, entry);
                    }
                })))
            }
            None => Attachment::Registry(RegistryWatch::attach(&self.registry, &self.me)),
        });
    }

    fn release(&self, slot: &mut Option<Attachment>) {
        self.queue.lock().clear();
        if let Some(attachment) = slot.take() {
            attachment.release();
        }
    }

    /// Sends the first envelope to a new session and adds it to the
    /// fan-out.
    ///
    /// Runs under the flush and queue locks: queued events go to the
    /// sessions already attached before `first` builds the envelope, and
    /// nothing can be queued until the session is in place.
    fn admit(
        &self,
        sink: Arc<dyn SessionSink>,
        first: impl FnOnce(&Self) -> Envelope,
    ) -> crate::Result<()> {
        let _flush = self.flush_lock.lock();
        let mut queue = self.queue.lock();
        self.flush_drained(queue.drain());

        let envelope = first(self);
        let text = self.codec.encode(&envelope).inspect_err(|_| {
            self.metrics.encode_failures.fetch_add(1, Ordering::Relaxed);
        })?;
        if let Err(e) = sink.send(&text) {
            self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("initial send failed: {e}");
            return Err(e.into());
        }
        self.seq.fetch_max(envelope.seq, Ordering::AcqRel);
        self.sessions.insert(sink);
        drop(queue);
        self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// First envelope of a session on a hub-fed core. `polled` is the hub's
    /// `poll(since)`.
    fn recovered_or_snapshot(&self, id: SessionId, since: u64, polled: Envelope) -> Envelope {
        if polled.is_empty() {
            return Envelope::new(polled.seq, snapshot_entries(&self.registry));
        }
        if since > 0 {
            tracing::info!(session = %id, "Recovered {} messages", polled.batch.len());
        }
        polled
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Sequence for an outgoing envelope: the hub's when the core is
    /// hub-fed, the core's own otherwise.
    fn tag(&self, hub_seq: u64) -> u64 {
        if self.source.is_some() {
            self.seq.fetch_max(hub_seq, Ordering::AcqRel);
            hub_seq
        } else {
            self.next_seq()
        }
    }

    fn enqueue(&self, event: PendingEvent) {
        let evicted = self.queue.lock().push(event);
        self.metrics.events_enqueued.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.metrics
                .events_dropped
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::warn!(evicted, "pending queue full, dropped oldest events");
        }
        self.schedule_flush();
    }

    fn schedule_flush(&self) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if self
            .flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let weak = self.me.clone();
            scheduler.schedule(
                self.config.flush_interval,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush();
                    }
                }),
            );
        }
    }

    fn flush(&self) {
        let _flush = self.flush_lock.lock();
        self.flush_scheduled.store(false, Ordering::Release);
        let drained = self.queue.lock().drain();
        self.flush_drained(drained);
    }

    /// Coalesces and broadcasts. Callers hold the flush lock.
    fn flush_drained(&self, drained: Drained) {
        if drained.is_empty() {
            return;
        }
        let hub_seq = drained.max_seq();
        let batch = coalesce(drained, |key| self.current_value(key));
        if batch.is_empty() {
            return;
        }
        let envelope = Envelope::new(self.tag(hub_seq), batch);
        if self.emit(&envelope) {
            self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn current_value(&self, key: &str) -> Option<Value> {
        match self.registry.get(key)?.snapshot() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(key, "cannot re-read conflicting key: {e}");
                self.metrics.encode_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Encodes and broadcasts. Returns `false` if encoding failed.
    fn emit(&self, envelope: &Envelope) -> bool {
        match self.codec.encode(envelope) {
            Ok(text) => {
                let (delivered, pruned) = self.sessions.broadcast(&text);
                self.metrics.record_delivery(delivered, pruned);
                true
            }
            Err(e) => {
                self.metrics.encode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(seq = envelope.seq, "dropping envelope: {e}");
                false
            }
        }
    }

    fn send_immediately(&self, entry: Entry, hub_seq: u64) {
        let _flush = self.flush_lock.lock();
        if self.sessions.is_empty() {
            return;
        }
        let envelope = Envelope::new(self.tag(hub_seq), vec![entry]);
        self.emit(&envelope);
    }

    fn on_sequenced(&self, seq: u64, entry: &Entry) {
        if self.config.backpressure_enabled {
            self.enqueue(PendingEvent::sequenced(seq, entry));
        } else {
            self.send_immediately(entry.clone(), seq);
        }
    }
}

impl ChangeHandler for CoreInner {
    fn on_snapshot(&self, key: &str, value: Result<Value, CodecError>) {
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                self.metrics.encode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key, "dropping change: {e}");
                return;
            }
        };
        if self.config.backpressure_enabled {
            self.enqueue(PendingEvent::snapshot(key, value));
        } else {
            self.send_immediately(Entry::snapshot(key, value), 0);
        }
    }

    fn on_delta(&self, key: &str, packet: DeltaPacket) {
        if packet.is_empty() {
            return;
        }
        if self.config.backpressure_enabled {
            self.enqueue(PendingEvent::delta(key, packet));
        } else {
            self.send_immediately(Entry::delta(key, packet), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Binding, OwnerTree, WriteError};
    use crate::collections::TrackedList;
    use crate::observable::Observable;
    use crate::scheduler::ManualScheduler;
    use crate::session::testing::RecordingSink;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Fixture {
        count: Observable<i64>,
        list: TrackedList<String>,
        sched: Arc<ManualScheduler>,
        core: BroadcastCore,
    }

    fn fixture(config: BroadcastConfig) -> Fixture {
        let count = Observable::new(0_i64);
        let list = TrackedList::new();
        let tree = OwnerTree::new("page")
            .bind("count", Binding::value(count.clone()))
            .bind("todos", Binding::tracked(Observable::new(list.clone())));
        let registry = BindingRegistry::from_tree(&tree).unwrap();
        let sched = Arc::new(ManualScheduler::new());
        let core = BroadcastCore::builder(registry)
            .scheduler(sched.clone())
            .config(config)
            .build();
        Fixture {
            count,
            list,
            sched,
            core,
        }
    }

    #[test]
    fn test_open_sends_full_snapshot() {
        let f = fixture(BroadcastConfig::default());
        f.list.push("a".into());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();

        let sent = sink.json();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["seq"], json!(1));
        assert_eq!(
            sent[0]["batch"],
            json!([{"k": "count", "v": 0}, {"k": "todos", "v": ["a"]}])
        );
        assert_eq!(f.core.session_count(), 1);
    }

    #[test]
    fn test_immediate_sends_each_change() {
        let f = fixture(BroadcastConfig::immediate());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();

        f.count.set(7);
        f.list.push("x".into());

        let sent = sink.json();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1], json!({"seq": 2, "batch": [{"k": "count", "v": 7}]}));
        assert_eq!(
            sent[2],
            json!({"seq": 3, "batch": [{"k": "todos", "delta": true, "type": "list",
                "changes": [{"op": "ADD", "index": 0, "item": "x"}]}]})
        );
        assert_eq!(f.sched.pending(), 0);
    }

    #[test]
    fn test_buffered_coalesces_within_window() {
        let f = fixture(BroadcastConfig::default());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();

        f.list.push("a".into());
        f.list.push("b".into());
        f.list.remove(0);
        f.count.set(1);
        f.count.set(2);
        assert_eq!(f.sched.pending(), 1);
        assert_eq!(f.core.pending_events(), 5);

        f.sched.advance(Duration::from_millis(5));
        assert_eq!(sink.messages.lock().len(), 1);
        f.sched.advance(Duration::from_millis(11));

        let sent = sink.json();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1],
            json!({"seq": 2, "batch": [
                {"k": "todos", "delta": true, "type": "list", "changes": [
                    {"op": "ADD", "index": 0, "item": "a"},
                    {"op": "ADD", "index": 1, "item": "b"},
                    {"op": "REMOVE", "index": 0, "item": null}
                ]},
                {"k": "count", "v": 2}
            ]})
        );
        assert_eq!(f.core.metrics().flushes(), 1);
        assert_eq!(f.core.pending_events(), 0);
    }

    #[test]
    fn test_flush_rearms_after_running() {
        let f = fixture(BroadcastConfig::default());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();

        f.count.set(1);
        f.sched.advance(Duration::from_millis(16));
        f.count.set(2);
        assert_eq!(f.sched.pending(), 1);
        f.sched.advance(Duration::from_millis(16));
        assert_eq!(sink.messages.lock().len(), 3);
        assert_eq!(f.core.current_sequence(), 3);
    }

    #[test]
    fn test_queue_overflow_resnapshots_evicted_key() {
        let f = fixture(BroadcastConfig::builder().max_queue_depth(2).build());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();

        f.list.push("a".into());
        f.list.push("b".into());
        f.list.push("c".into());
        f.core.flush_now();

        assert_eq!(f.core.metrics().events_dropped(), 1);
        let sent = sink.json();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["batch"], json!([{"k": "todos", "v": ["a", "b", "c"]}]));
    }

    #[test]
    fn test_queue_overflow_keeps_unaffected_keys() {
        let f = fixture(BroadcastConfig::builder().max_queue_depth(2).build());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();

        f.list.push("a".into());
        f.list.push("b".into());
        f.count.set(3);
        f.core.flush_now();

        assert_eq!(
            sink.json()[1]["batch"],
            json!([{"k": "todos", "v": ["a", "b"]}, {"k": "count", "v": 3}])
        );
    }

    #[test]
    fn test_attaches_on_first_open() {
        let f = fixture(BroadcastConfig::default());
        assert!(!f.core.is_attached());
        assert_eq!(f.count.listener_count(), 0);

        f.list.push("early".into());
        assert_eq!(f.core.pending_events(), 0);
        assert_eq!(f.sched.pending(), 0);

        f.core.on_open(RecordingSink::new(), None, 0).unwrap();
        assert!(f.core.is_attached());
        assert_eq!(f.count.listener_count(), 1);
    }

    #[test]
    fn test_open_flushes_queued_events_to_existing_sessions_only() {
        let f = fixture(BroadcastConfig::default());
        let first = RecordingSink::new();
        f.core.on_open(first.clone(), None, 0).unwrap();

        f.list.push("a".into());
        let second = RecordingSink::new();
        f.core.on_open(second.clone(), None, 0).unwrap();
        f.sched.run_pending();

        let old = first.json();
        assert_eq!(old.len(), 2);
        assert_eq!(
            old[1]["batch"],
            json!([{"k": "todos", "delta": true, "type": "list",
                "changes": [{"op": "ADD", "index": 0, "item": "a"}]}])
        );
        let new = second.json();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0]["seq"], json!(3));
        assert_eq!(new[0]["batch"][1], json!({"k": "todos", "v": ["a"]}));
    }

    #[test]
    fn test_recovered_session_continues_after_hub_sequence() {
        let count = Observable::new(0_i64);
        let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
        let hub = ReplayHub::new(BindingRegistry::from_tree(&tree).unwrap());
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
            .config(BroadcastConfig::immediate())
            .build();
        for n in 1..=5 {
            count.set(n);
        }

        let sink = RecordingSink::new();
        core.on_open(sink.clone(), Some(&hub), 2).unwrap();
        count.set(6);

        let seqs: Vec<u64> = sink.json().iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs[0], 5);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    }

    #[test]
    fn test_hub_fed_core_uses_hub_sequences() {
        let count = Observable::new(0_i64);
        let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
        let hub = ReplayHub::new(BindingRegistry::from_tree(&tree).unwrap());
        let sched = Arc::new(ManualScheduler::new());
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
            .scheduler(sched.clone())
            .replay(hub.clone())
            .build();
        for n in 1..=5 {
            count.set(n);
        }

        let sink = RecordingSink::new();
        core.on_open(sink.clone(), None, 2).unwrap();
        count.set(6);
        count.set(7);
        sched.run_pending();

        let sent = sink.json();
        assert_eq!(sent[0]["seq"], json!(5));
        assert_eq!(sent[0]["batch"].as_array().unwrap().len(), 3);
        assert_eq!(sent[1], json!({"seq": 7, "batch": [{"k": "count", "v": 7}]}));
        assert_eq!(core.current_sequence(), hub.current_sequence());

        // The last sequence the client saw is a valid resume point.
        core.on_close(sink.id());
        count.set(8);
        let again = RecordingSink::new();
        core.on_open(again.clone(), Some(&hub), 7).unwrap();
        assert_eq!(again.json()[0], json!({"seq": 8, "batch": [{"k": "count", "v": 8}]}));
    }

    #[test]
    fn test_hub_fed_core_detaches_from_hub_on_last_close() {
        let count = Observable::new(0_i64);
        let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
        let hub = ReplayHub::new(BindingRegistry::from_tree(&tree).unwrap());
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
            .config(BroadcastConfig::immediate())
            .replay(hub.clone())
            .build();

        let sink = RecordingSink::new();
        core.on_open(sink.clone(), None, 0).unwrap();
        count.set(1);
        core.on_close(sink.id());
        count.set(2);

        assert!(!core.is_attached());
        assert_eq!(sink.messages.lock().len(), 2);
        assert_eq!(core.current_sequence(), 1);
    }

    /// Sink whose first live send blocks until released.
    struct GatedSink {
        id: SessionId,
        sends: AtomicUsize,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
        seqs: Mutex<Vec<u64>>,
    }

    impl SessionSink for GatedSink {
        fn id(&self) -> SessionId {
            self.id
        }

        fn is_open(&self) -> bool {
            true
        }

        fn send(&self, text: &str) -> Result<(), crate::session::SessionError> {
            let envelope: Envelope = serde_json::from_str(text).unwrap();
            if self.sends.fetch_add(1, Ordering::SeqCst) == 1 {
                if let Some(entered) = self.entered.lock().take() {
                    entered.send(()).unwrap();
                }
                let release = self.release.lock().take();
                if let Some(release) = release {
                    release.recv().unwrap();
                }
            }
            self.seqs.lock().push(envelope.seq);
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn test_overlapping_flushes_reach_every_session_in_order() {
        let f = fixture(BroadcastConfig::default());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gated = Arc::new(GatedSink {
            id: SessionId::generate(),
            sends: AtomicUsize::new(0),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
            seqs: Mutex::new(Vec::new()),
        });
        let plain = RecordingSink::new();
        f.core.on_open(gated.clone(), None, 0).unwrap();
        f.core.on_open(plain.clone(), None, 0).unwrap();

        f.count.set(1);
        let first = {
            let core = f.core.clone();
            std::thread::spawn(move || core.flush_now())
        };
        entered_rx.recv().unwrap();

        f.count.set(2);
        let second = {
            let core = f.core.clone();
            std::thread::spawn(move || core.flush_now())
        };
        std::thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();
        first.join().unwrap();
        second.join().unwrap();

        let plain_seqs: Vec<u64> = plain
            .json()
            .iter()
            .map(|e| e["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(plain_seqs, vec![2, 3, 4]);
        assert_eq!(*gated.seqs.lock(), vec![1, 3, 4]);
    }

    #[test]
    fn test_snapshot_delta_conflict_sends_value_at_flush_time() {
        let todos = Observable::new(TrackedList::new());
        let tree = OwnerTree::new("page").bind("todos", Binding::tracked(todos.clone()));
        let sched = Arc::new(ManualScheduler::new());
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
            .scheduler(sched.clone())
            .build();
        let sink = RecordingSink::new();
        core.on_open(sink.clone(), None, 0).unwrap();

        let fresh = TrackedList::from(vec![1, 2]);
        todos.set(fresh.clone());
        fresh.push(3);
        sched.run_pending();

        let sent = sink.json();
        assert_eq!(sent[1]["batch"], json!([{"k": "todos", "v": [1, 2, 3]}]));
    }

    #[test]
    fn test_failed_session_is_pruned() {
        let f = fixture(BroadcastConfig::immediate());
        let good = RecordingSink::new();
        let bad = RecordingSink::new();
        f.core.on_open(good.clone(), None, 0).unwrap();
        f.core.on_open(bad.clone(), None, 0).unwrap();
        bad.fail_sends();

        f.count.set(1);
        assert_eq!(f.core.session_count(), 1);
        assert_eq!(f.core.metrics().send_failures(), 1);
        assert_eq!(good.messages.lock().len(), 2);
    }

    #[test]
    fn test_last_close_releases_and_reopen_reattaches() {
        let f = fixture(BroadcastConfig::default());
        let sink = RecordingSink::new();
        f.core.on_open(sink.clone(), None, 0).unwrap();
        assert_eq!(f.count.listener_count(), 1);
        assert_eq!(f.list.listener_count(), 1);

        f.count.set(4);
        f.core.on_close(sink.id());
        assert!(!f.core.is_attached());
        assert_eq!(f.core.pending_events(), 0);
        assert_eq!(f.count.listener_count(), 0);
        assert_eq!(f.list.listener_count(), 0);

        let again = RecordingSink::new();
        f.core.on_open(again.clone(), None, 0).unwrap();
        assert!(f.core.is_attached());
        assert_eq!(again.json()[0]["batch"][0], json!({"k": "count", "v": 4}));
    }

    #[test]
    fn test_on_message_assigns_and_persists() {
        let persisted = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&persisted);
        let count = Observable::new(0_i64);
        let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap())
            .config(BroadcastConfig::immediate())
            .persist(Arc::new(move |_: &BindingRegistry| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok::<(), crate::protocol::BoxError>(())
            }))
            .build();
        let session = SessionId::generate();

        let outcome = core.on_message(session, r#"{"k":"count","v":9}"#).unwrap();
        assert_eq!(outcome, WriteOutcome::Assigned);
        assert_eq!(count.get(), 9);
        assert_eq!(persisted.load(Ordering::SeqCst), 1);

        let err = core.on_message(session, r#"{"k":"missing","v":1}"#).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Write(WriteError::UnknownKey(ref k)) if k == "missing"
        ));
        assert!(matches!(
            core.on_message(session, "{"),
            Err(crate::Error::Codec(_))
        ));
        assert_eq!(persisted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_without_scheduler_falls_back_to_immediate() {
        let tree = OwnerTree::new("page").bind("n", Binding::value(Observable::new(1)));
        let core = BroadcastCore::builder(BindingRegistry::from_tree(&tree).unwrap()).build();
        assert!(!core.config().backpressure_enabled);
    }
}
