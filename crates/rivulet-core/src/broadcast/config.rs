//! Broadcast core configuration and metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default maximum number of pending events before the oldest are dropped.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 512;

/// Default flush debounce window.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(16);

/// Broadcast core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Queue and coalesce changes (`true`) or send each change immediately.
    pub backpressure_enabled: bool,

    /// Pending events kept before the oldest are dropped.
    pub max_queue_depth: usize,

    /// Debounce window between the first queued change and its flush.
    pub flush_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            backpressure_enabled: true,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl BroadcastConfig {
    /// Configuration that sends every change synchronously.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            backpressure_enabled: false,
            ..Default::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> BroadcastConfigBuilder {
        BroadcastConfigBuilder::default()
    }

    /// Queue depth actually enforced (at least one event).
    #[must_use]
    pub fn effective_queue_depth(&self) -> usize {
        self.max_queue_depth.max(1)
    }
}

/// Builder for [`BroadcastConfig`].
#[derive(Debug, Default)]
pub struct BroadcastConfigBuilder {
    backpressure_enabled: Option<bool>,
    max_queue_depth: Option<usize>,
    flush_interval: Option<Duration>,
}

impl BroadcastConfigBuilder {
    /// Enables or disables queueing and coalescing.
    #[must_use]
    pub fn backpressure(mut self, enabled: bool) -> Self {
        self.backpressure_enabled = Some(enabled);
        self
    }

    /// Sets the maximum pending queue depth.
    #[must_use]
    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Sets the flush debounce window.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> BroadcastConfig {
        BroadcastConfig {
            backpressure_enabled: self.backpressure_enabled.unwrap_or(true),
            max_queue_depth: self.max_queue_depth.unwrap_or(DEFAULT_MAX_QUEUE_DEPTH),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
        }
    }
}

// ---------------------------------------------------------------------------
// BroadcastMetrics
// ---------------------------------------------------------------------------

/// Atomic counters for monitoring a broadcast core.
#[derive(Debug, Default)]
pub struct BroadcastMetrics {
    /// Events appended to the pending queue.
    pub events_enqueued: AtomicU64,
    /// Events dropped because the queue was full.
    pub events_dropped: AtomicU64,
    /// Flushes that emitted an envelope.
    pub flushes: AtomicU64,
    /// Messages delivered to sessions.
    pub messages_sent: AtomicU64,
    /// Sends that failed and pruned their session.
    pub send_failures: AtomicU64,
    /// Changes or flushes dropped because encoding failed.
    pub encode_failures: AtomicU64,
}

impl BroadcastMetrics {
    /// Returns total events enqueued.
    #[must_use]
    pub fn events_enqueued(&self) -> u64 {
        self.events_enqueued.load(Ordering::Relaxed)
    }

    /// Returns total events dropped.
    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Returns total flushes.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns total messages sent.
    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Returns total failed sends.
    #[must_use]
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Returns total encode failures.
    #[must_use]
    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_delivery(&self, delivered: usize, pruned: usize) {
        self.messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.send_failures.fetch_add(pruned as u64, Ordering::Relaxed);
    }
}
