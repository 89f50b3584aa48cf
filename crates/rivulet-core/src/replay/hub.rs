//! Sequenced broadcast with bounded replay.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::broker::MessageBroker;
use super::buffer::ReplayBuffer;
use super::config::ReplayConfig;
use crate::binding::{run_persist, BindingRegistry, PersistHook, WriteOutcome};
use crate::broadcast::snapshot_entries;
use crate::observable::Subscription;
use crate::protocol::{Codec, CodecError, DeltaPacket, Entry, Envelope, JsonCodec};
use crate::session::{SessionId, SessionSet, SessionSink};
use crate::watch::{ChangeHandler, RegistryWatch};

/// Builder for [`ReplayHub`].
pub struct ReplayHubBuilder {
    registry: BindingRegistry,
    config: ReplayConfig,
    codec: Option<Arc<dyn Codec>>,
    persist: Option<PersistHook>,
    relay: Option<Relay>,
}

impl ReplayHubBuilder {
    /// Sets the replay configuration.
    #[must_use]
    pub fn config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the envelope codec. Defaults to [`JsonCodec`].
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Sets a hook run after every [`set`](ReplayHub::set) that changed
    /// state.
    #[must_use]
    pub fn persist(mut self, hook: PersistHook) -> Self {
        self.persist = Some(hook);
        self
    }

    /// Publishes every envelope to `broker` under `session`.
    #[must_use]
    pub fn relay(mut self, broker: Arc<dyn MessageBroker>, session: impl Into<String>) -> Self {
        self.relay = Some(Relay {
            broker,
            session: session.into(),
        });
        self
    }

    /// Builds the hub and subscribes it to every binding.
    #[must_use]
    pub fn build(self) -> ReplayHub {
        let capacity = self.config.effective_capacity();
        let inner = Arc::new_cyclic(|me: &Weak<HubInner>| HubInner {
            me: me.clone(),
            registry: self.registry,
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            state: Mutex::new(HubState {
                seq: 0,
                buffer: ReplayBuffer::new(capacity),
            }),
            emit_lock: Mutex::new(()),
            sinks: SessionSet::new(),
            feeds: RwLock::new(FxHashMap::default()),
            next_feed: AtomicU64::new(0),
            watch: Mutex::new(None),
            persist: self.persist,
            relay: self.relay,
            closed: AtomicBool::new(false),
        });
        *inner.watch.lock() = Some(RegistryWatch::attach(&inner.registry, &inner.me));
        ReplayHub { inner }
    }
}

struct Relay {
    broker: Arc<dyn MessageBroker>,
    session: String,
}

/// Receives every recorded change together with its sequence.
pub(crate) type SequencedListener = Arc<dyn Fn(u64, &Entry) + Send + Sync>;

// ---------------------------------------------------------------------------
// ReplayHub
// ---------------------------------------------------------------------------

/// Numbers every state change of one registry, keeps the newest ones for
/// replay and forwards each change to the live sinks.
///
/// ```text
/// change ─► state lock { seq += 1; buffer.push } ─► emit lock { encode; send to sinks }
/// ```
///
/// The emit lock is taken before the state lock is released, so live sinks
/// and sequenced feeds receive changes in sequence order and never see a
/// sequence the buffer does not have yet.
#[derive(Clone)]
pub struct ReplayHub {
    inner: Arc<HubInner>,
}

struct HubState {
    seq: u64,
    buffer: ReplayBuffer,
}

struct HubInner {
    me: Weak<HubInner>,
    registry: BindingRegistry,
    codec: Arc<dyn Codec>,
    state: Mutex<HubState>,
    emit_lock: Mutex<()>,
    sinks: SessionSet,
    feeds: RwLock<FxHashMap<u64, SequencedListener>>,
    next_feed: AtomicU64,
    watch: Mutex<Option<RegistryWatch>>,
    persist: Option<PersistHook>,
    relay: Option<Relay>,
    closed: AtomicBool,
}

impl ReplayHub {
    /// Starts building a hub over `registry`.
    #[must_use]
    pub fn builder(registry: BindingRegistry) -> ReplayHubBuilder {
        ReplayHubBuilder {
            registry,
            config: ReplayConfig::default(),
            codec: None,
            persist: None,
            relay: None,
        }
    }

    /// Creates a hub with the default configuration.
    #[must_use]
    pub fn new(registry: BindingRegistry) -> Self {
        Self::builder(registry).build()
    }

    /// Returns what a client that has seen everything up to `since` is
    /// missing.
    ///
    /// `since == 0`, a sequence from the future, or one older than the
    /// retained window yields a full snapshot tagged with the current
    /// sequence. Otherwise the batch holds exactly the retained changes after
    /// `since`, tagged with the newest of them (or `since` if there are none).
    #[must_use]
    pub fn poll(&self, since: u64) -> Envelope {
        let state = self.inner.state.lock();
        self.inner.poll_locked(&state, since)
    }

    /// Full snapshot tagged with the current sequence.
    #[must_use]
    pub fn snapshot(&self) -> Envelope {
        let state = self.inner.state.lock();
        Envelope::new(state.seq, snapshot_entries(&self.inner.registry))
    }

    /// Registers a push sink and sends it `poll(since)` (a full snapshot
    /// when `since == 0`). Every later change reaches it in sequence order.
    ///
    /// # Errors
    ///
    /// Returns the encode or send error; on a send error the sink has been
    /// closed and deregistered.
    pub fn subscribe(&self, sink: Arc<dyn SessionSink>, since: u64) -> crate::Result<()> {
        let inner = &self.inner;
        let id = sink.id();

        let state = inner.state.lock();
        let envelope = inner.poll_locked(&state, since);
        let _emit = inner.emit_lock.lock();
        drop(state);

        let text = inner.codec.encode(&envelope)?;
        inner.sinks.insert(Arc::clone(&sink));
        if let Err(e) = inner.sinks.send_to(id, &text) {
            inner.sinks.remove(id);
            sink.close();
            tracing::warn!(session = %id, "initial replay send failed: {e}");
            return Err(e.into());
        }
        tracing::debug!(session = %id, since, seq = envelope.seq, "sink subscribed");
        Ok(())
    }

    /// Registers a listener for every change recorded from now on. Calls
    /// arrive in sequence order.
    pub(crate) fn feed(&self, listener: SequencedListener) -> Subscription {
        let id = self.inner.next_feed.fetch_add(1, Ordering::Relaxed);
        self.inner.feeds.write().insert(id, listener);
        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.feeds.write().remove(&id);
            }
        })
    }

    /// Runs `f` with `poll(since)` while no change is being delivered.
    ///
    /// Every change up to the envelope's sequence has already reached the
    /// feeds when `f` starts, and none after it reaches them before `f`
    /// returns.
    pub(crate) fn with_poll<R>(&self, since: u64, f: impl FnOnce(Envelope) -> R) -> R {
        let state = self.inner.state.lock();
        let envelope = self.inner.poll_locked(&state, since);
        let _emit = self.inner.emit_lock.lock();
        drop(state);
        f(envelope)
    }

    /// Removes and closes a sink. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: SessionId) -> bool {
        match self.inner.sinks.take(id) {
            Some(sink) => {
                sink.close();
                true
            }
            None => false,
        }
    }

    /// Applies a write without a live session.
    ///
    /// Keys resolve as in [`BindingRegistry::write`]. The persistence hook
    /// runs when state changed.
    ///
    /// # Errors
    ///
    /// Returns the [`WriteError`](crate::binding::WriteError) of a rejected
    /// write.
    pub fn set(&self, key: &str, value: &Value) -> crate::Result<WriteOutcome> {
        let outcome = self.inner.registry.write(key, value)?;
        if outcome.changed() {
            run_persist(self.inner.persist.as_ref(), &self.inner.registry, key);
        }
        Ok(outcome)
    }

    /// Sends an already-encoded message to every sink without assigning a
    /// sequence or recording it.
    pub fn emit_raw(&self, text: &str) {
        let _emit = self.inner.emit_lock.lock();
        self.inner.sinks.broadcast(text);
    }

    /// Stops observing the registry, closes every sink and clears the
    /// buffer. Later changes are ignored.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watch) = inner.watch.lock().take() {
            watch.release();
        }
        inner.sinks.close_all();
        inner.feeds.write().clear();
        inner.state.lock().buffer.clear();
        tracing::debug!("replay hub closed");
    }

    /// Sequence of the newest change.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.inner.state.lock().seq
    }

    /// Number of changes retained for replay.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.inner.sinks.len()
    }

    /// Returns `true` once [`close`](Self::close) ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns the registry this hub serves.
    #[must_use]
    pub fn registry(&self) -> &BindingRegistry {
        &self.inner.registry
    }

    /// Returns `true` if both handles refer to the same hub.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReplayHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayHub")
            .field("keys", &self.inner.registry.len())
            .field("seq", &self.current_sequence())
            .field("sinks", &self.inner.sinks.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HubInner
// ---------------------------------------------------------------------------

impl HubInner {
    fn poll_locked(&self, state: &HubState, since: u64) -> Envelope {
        if !state.buffer.covers(since, state.seq) {
            return Envelope::new(state.seq, snapshot_entries(&self.registry));
        }
        let batch: Vec<Entry> = state
            .buffer
            .after(since)
            .map(|message| message.entry.clone())
            .collect();
        let last = state.buffer.newest_seq().filter(|_| !batch.is_empty());
        Envelope::new(last.unwrap_or(since), batch)
    }

    fn record(&self, entry: Entry) {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        state.seq += 1;
        let seq = state.seq;
        state.buffer.push(seq, entry.clone());
        let _emit = self.emit_lock.lock();
        drop(state);

        let feeds: Vec<SequencedListener> = self.feeds.read().values().cloned().collect();
        for feed in &feeds {
            feed(seq, &entry);
        }

        let envelope = Envelope::new(seq, vec![entry]);
        let text = match self.codec.encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(seq, "change recorded but not sent: {e}");
                return;
            }
        };
        self.sinks.broadcast(&text);
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.broker.publish(&relay.session, &text) {
                tracing::warn!(session = %relay.session, seq, "relay publish failed: {e}");
            }
        }
    }
}

impl ChangeHandler for HubInner {
    fn on_snapshot(&self, key: &str, value: Result<Value, CodecError>) {
        match value {
            Ok(value) => self.record(Entry::snapshot(key, value)),
            Err(e) => tracing::error!(key, "dropping change: {e}"),
        }
    }

    fn on_delta(&self, key: &str, packet: DeltaPacket) {
        if !packet.is_empty() {
            self.record(Entry::delta(key, packet));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Binding, OwnerTree};
    use crate::collections::TrackedList;
    use crate::observable::Observable;
    use crate::replay::broker::InMemoryBus;
    use crate::session::testing::RecordingSink;
    use serde_json::json;

    fn hub_with(capacity: usize) -> (Observable<i64>, TrackedList<String>, ReplayHub) {
        let count = Observable::new(0_i64);
        let list = TrackedList::new();
        let tree = OwnerTree::new("page")
            .bind("count", Binding::value(count.clone()))
            .bind("todos", Binding::tracked(Observable::new(list.clone())));
        let hub = ReplayHub::builder(BindingRegistry::from_tree(&tree).unwrap())
            .config(ReplayConfig::with_capacity(capacity))
            .build();
        (count, list, hub)
    }

    #[test]
    fn test_every_change_gets_the_next_sequence() {
        let (count, list, hub) = hub_with(100);
        count.set(1);
        list.push("a".into());
        count.set(2);
        assert_eq!(hub.current_sequence(), 3);
        assert_eq!(hub.buffered(), 3);
    }

    #[test]
    fn test_poll_current_is_empty() {
        let (count, _list, hub) = hub_with(100);
        count.set(1);
        let envelope = hub.poll(hub.current_sequence());
        assert!(envelope.is_empty());
        assert_eq!(envelope.seq, 1);
    }

    #[test]
    fn test_poll_zero_is_full_snapshot() {
        let (count, list, hub) = hub_with(100);
        count.set(5);
        list.push("x".into());
        let envelope = hub.poll(0);
        assert_eq!(envelope.seq, 2);
        assert_eq!(
            envelope.batch,
            vec![
                Entry::snapshot("count", json!(5)),
                Entry::snapshot("todos", json!(["x"]))
            ]
        );
    }

    #[test]
    fn test_poll_returns_missed_changes() {
        let (count, list, hub) = hub_with(100);
        count.set(1);
        list.push("a".into());
        count.set(2);

        let envelope = hub.poll(1);
        assert_eq!(envelope.seq, 3);
        assert_eq!(envelope.batch.len(), 2);
        assert!(envelope.batch[0].is_delta());
        assert_eq!(envelope.batch[1], Entry::snapshot("count", json!(2)));
    }

    #[test]
    fn test_poll_outside_window_is_snapshot() {
        let (count, _list, hub) = hub_with(100);
        for n in 1..=150 {
            count.set(n);
        }
        let stale = hub.poll(10);
        assert_eq!(stale.seq, 150);
        assert_eq!(stale.batch[0], Entry::snapshot("count", json!(150)));
        assert_eq!(stale.batch.len(), 2);

        let future = hub.poll(999);
        assert_eq!(future.seq, 150);
        assert_eq!(future.batch.len(), 2);

        // Oldest retained is 51, so resuming from 50 is still exact.
        let edge = hub.poll(50);
        assert_eq!(edge.batch.len(), 100);
    }

    #[test]
    fn test_subscribe_then_live_changes_in_order() {
        let (count, _list, hub) = hub_with(100);
        count.set(1);
        let sink = RecordingSink::new();
        hub.subscribe(sink.clone(), 0).unwrap();
        count.set(2);

        let sent = sink.json();
        assert_eq!(sent[0]["seq"], json!(1));
        assert_eq!(sent[0]["batch"].as_array().unwrap().len(), 2);
        assert_eq!(sent[1], json!({"seq": 2, "batch": [{"k": "count", "v": 2}]}));
    }

    #[test]
    fn test_subscribe_failure_closes_sink() {
        let (_count, _list, hub) = hub_with(100);
        let sink = RecordingSink::new();
        sink.fail_sends();
        assert!(hub.subscribe(sink.clone(), 0).is_err());
        assert_eq!(hub.sink_count(), 0);
        assert!(!sink.is_open());
    }

    #[test]
    fn test_set_updates_state_and_records_change() {
        let (count, _list, hub) = hub_with(100);
        assert_eq!(hub.set("count", &json!(4)).unwrap(), WriteOutcome::Assigned);
        assert_eq!(count.get(), 4);
        assert_eq!(hub.current_sequence(), 1);
        assert!(matches!(
            hub.set("nope", &json!(1)),
            Err(crate::Error::Write(_))
        ));
    }

    #[test]
    fn test_emit_raw_bypasses_sequence() {
        let (_count, _list, hub) = hub_with(100);
        let sink = RecordingSink::new();
        hub.subscribe(sink.clone(), 0).unwrap();
        hub.emit_raw("raw");
        assert_eq!(hub.current_sequence(), 0);
        assert_eq!(sink.messages.lock().last().unwrap(), "raw");
    }

    #[test]
    fn test_close_releases_everything() {
        let (count, _list, hub) = hub_with(100);
        let sink = RecordingSink::new();
        hub.subscribe(sink.clone(), 0).unwrap();
        count.set(1);
        hub.close();

        assert!(hub.is_closed());
        assert!(!sink.is_open());
        assert_eq!(hub.buffered(), 0);
        assert_eq!(count.listener_count(), 0);
        count.set(2);
        assert_eq!(hub.current_sequence(), 1);
    }

    #[test]
    fn test_unsubscribe_closes_sink() {
        let (_count, _list, hub) = hub_with(100);
        let sink = RecordingSink::new();
        hub.subscribe(sink.clone(), 0).unwrap();
        assert!(hub.unsubscribe(sink.id()));
        assert!(!hub.unsubscribe(sink.id()));
        assert!(!sink.is_open());
    }

    #[test]
    fn test_feed_receives_sequenced_changes() {
        let (count, list, hub) = hub_with(100);
        count.set(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let mut feed = hub.feed(Arc::new(move |seq: u64, entry: &Entry| {
            log.lock().push((seq, entry.key().to_string()));
        }));

        list.push("a".into());
        count.set(2);
        feed.unsubscribe();
        count.set(3);

        assert_eq!(
            *seen.lock(),
            vec![(2, "todos".to_string()), (3, "count".to_string())]
        );
    }

    #[test]
    fn test_with_poll_sees_current_sequence() {
        let (count, _list, hub) = hub_with(100);
        count.set(1);
        count.set(2);
        let (seq, len) = hub.with_poll(1, |envelope| (envelope.seq, envelope.batch.len()));
        assert_eq!((seq, len), (2, 1));
    }

    #[test]
    fn test_relay_publishes_encoded_envelopes() {
        let bus = InMemoryBus::new();
        let local = bus.broker();
        let remote = bus.broker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = remote.on_message(Arc::new(move |session: &str, message: &str| {
            sink.lock().push((session.to_string(), message.to_string()));
        }));

        let count = Observable::new(0);
        let tree = OwnerTree::new("page").bind("count", Binding::value(count.clone()));
        let _hub = ReplayHub::builder(BindingRegistry::from_tree(&tree).unwrap())
            .relay(Arc::new(local), "s-1")
            .build();
        count.set(3);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "s-1");
        let envelope: Envelope = serde_json::from_str(&seen[0].1).unwrap();
        assert_eq!(envelope, Envelope::new(1, vec![Entry::snapshot("count", json!(3))]));
    }
}
