//! # Broadcast
//!
//! Push-side synchronization: a [`BroadcastCore`] watches every binding of a
//! registry and sends encoded envelopes to its live sessions.
//!
//! ## Delivery Policies
//!
//! ```text
//! immediate   change ──encode──► {seq, [entry]} ──► every session
//!
//! buffered    change ──► PendingQueue (oldest-drop at max_queue_depth)
//!                              │ first change arms one flush
//!                              ▼ after flush_interval
//!                         coalesce per key ──encode──► {seq, [entries]} ──► every session
//! ```
//!
//! Coalescing keeps the first-arrival order of keys:
//!
//! | queued for one key        | flushed as                         |
//! |---------------------------|------------------------------------|
//! | snapshot, snapshot        | latest snapshot                    |
//! | delta, delta (same kind)  | one delta with concatenated changes|
//! | any other mix             | snapshot of the value at flush time|
//!
//! A session whose send fails is dropped from the fan-out without retry.

mod config;
mod engine;
mod queue;

pub use self::config::{
    BroadcastConfig, BroadcastConfigBuilder, BroadcastMetrics, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_MAX_QUEUE_DEPTH,
};
pub use self::engine::{BroadcastCore, BroadcastCoreBuilder};

pub(crate) use self::engine::snapshot_entries;
