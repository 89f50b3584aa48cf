//! Bounded pending-event queue and per-key coalescing.

use std::collections::VecDeque;
use std::sync::Arc;

use fxhash::FxHashMap;
use serde_json::Value;

use crate::protocol::{DeltaPacket, Entry};

/// Payload of one queued change.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingPayload {
    /// The variable stored a new value.
    Snapshot(Value),
    /// A tracked collection logged changes.
    Delta(DeltaPacket),
}

/// One queued change for one key.
#[derive(Debug, Clone)]
pub(crate) struct PendingEvent {
    pub(crate) key: Arc<str>,
    pub(crate) payload: PendingPayload,
    /// Replay hub sequence of the change, `0` when the core numbers its own
    /// envelopes.
    pub(crate) seq: u64,
}

impl PendingEvent {
    pub(crate) fn snapshot(key: &str, value: Value) -> Self {
        Self {
            key: Arc::from(key),
            payload: PendingPayload::Snapshot(value),
            seq: 0,
        }
    }

    pub(crate) fn delta(key: &str, packet: DeltaPacket) -> Self {
        Self {
            key: Arc::from(key),
            payload: PendingPayload::Delta(packet),
            seq: 0,
        }
    }

    /// Converts an entry recorded by a replay hub.
    pub(crate) fn sequenced(seq: u64, entry: &Entry) -> Self {
        let event = match entry {
            Entry::Snapshot(s) => Self::snapshot(&s.k, s.v.clone()),
            Entry::Delta(d) => Self::delta(
                &d.k,
                DeltaPacket {
                    kind: d.kind,
                    changes: d.changes.clone(),
                },
            ),
        };
        Self { seq, ..event }
    }
}

/// Everything taken out of the queue by one drain.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub(crate) events: Vec<PendingEvent>,
    /// Keys that lost an event to eviction, in eviction order.
    pub(crate) stale: Vec<Arc<str>>,
}

impl Drained {
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty() && self.stale.is_empty()
    }

    /// Highest replay sequence among the drained events.
    pub(crate) fn max_seq(&self) -> u64 {
        self.events.iter().map(|e| e.seq).max().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// PendingQueue
// ---------------------------------------------------------------------------

/// FIFO of pending events with oldest-drop eviction.
///
/// An evicted delta has already been taken out of its collection's log, so
/// the changes after it no longer have a base on the client. Every key that
/// loses an event is remembered as stale and flushed as a snapshot of its
/// value at flush time.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    events: VecDeque<PendingEvent>,
    stale: Vec<Arc<str>>,
    capacity: usize,
    dropped: u64,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            stale: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Appends an event. Returns the number of events evicted to make room.
    pub(crate) fn push(&mut self, event: PendingEvent) -> usize {
        let mut evicted = 0;
        while self.events.len() >= self.capacity {
            let Some(oldest) = self.events.pop_front() else {
                break;
            };
            if !self.stale.contains(&oldest.key) {
                self.stale.push(oldest.key);
            }
            evicted += 1;
        }
        self.dropped += evicted as u64;
        self.events.push_back(event);
        evicted
    }

    pub(crate) fn drain(&mut self) -> Drained {
        Drained {
            events: self.events.drain(..).collect(),
            stale: std::mem::take(&mut self.stale),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.stale.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

enum Slot {
    Ready(PendingPayload),
    Conflict,
}

/// Merges drained events into at most one entry per key, keyed in order of
/// each key's first arrival. Stale keys come first, since their evicted
/// events arrived before anything still queued.
///
/// - snapshot then snapshot keeps the latest value
/// - deltas of the same kind concatenate in arrival order
/// - a stale key, or any other combination, is replaced by `current(key)`,
///   the value at flush time; keys whose current value cannot be read are
///   skipped
pub(crate) fn coalesce<F>(drained: Drained, current: F) -> Vec<Entry>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut order: Vec<(Arc<str>, Slot)> = Vec::new();
    let mut index: FxHashMap<Arc<str>, usize> = FxHashMap::default();

    for key in drained.stale {
        if !index.contains_key(&key) {
            index.insert(Arc::clone(&key), order.len());
            order.push((key, Slot::Conflict));
        }
    }

    for event in drained.events {
        let Some(at) = index.get(&event.key).copied() else {
            index.insert(Arc::clone(&event.key), order.len());
            order.push((event.key, Slot::Ready(event.payload)));
            continue;
        };
        let slot = &mut order[at].1;
        *slot = match (std::mem::replace(slot, Slot::Conflict), event.payload) {
            (Slot::Ready(PendingPayload::Snapshot(_)), PendingPayload::Snapshot(latest)) => {
                Slot::Ready(PendingPayload::Snapshot(latest))
            }
            (Slot::Ready(PendingPayload::Delta(mut first)), PendingPayload::Delta(next))
                if first.kind == next.kind =>
            {
                first.concat(next);
                Slot::Ready(PendingPayload::Delta(first))
            }
            _ => Slot::Conflict,
        };
    }

    order
        .into_iter()
        .filter_map(|(key, slot)| match slot {
            Slot::Ready(PendingPayload::Snapshot(value)) => Some(Entry::snapshot(&*key, value)),
            Slot::Ready(PendingPayload::Delta(packet)) => Some(Entry::delta(&*key, packet)),
            Slot::Conflict => current(&key).map(|value| Entry::snapshot(&*key, value)),
        })
        .collect()
}
