//! Replay hub and hub manager configuration.

use std::time::Duration;

/// Smallest replay window a hub keeps, whatever the configuration says.
pub const MIN_REPLAY_CAPACITY: usize = 100;

/// Default replay window.
pub const DEFAULT_REPLAY_CAPACITY: usize = 2000;

/// Default idle time after which a managed hub is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default maximum number of live managed hubs.
pub const DEFAULT_MAX_HUBS: usize = 5000;

/// Replay hub configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Number of sequenced messages retained for replay.
    pub capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

impl ReplayConfig {
    /// Creates a configuration with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Capacity actually enforced (at least [`MIN_REPLAY_CAPACITY`]).
    #[must_use]
    pub fn effective_capacity(&self) -> usize {
        self.capacity.max(MIN_REPLAY_CAPACITY)
    }
}

/// Hub manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubManagerConfig {
    /// Hubs not accessed for this long are evicted.
    pub idle_timeout: Duration,

    /// Maximum live hubs; the least recently used is evicted beyond it.
    pub max_hubs: usize,

    /// Configuration of every hub the manager creates.
    pub replay: ReplayConfig,
}

impl Default for HubManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_hubs: DEFAULT_MAX_HUBS,
            replay: ReplayConfig::default(),
        }
    }
}

impl HubManagerConfig {
    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> HubManagerConfigBuilder {
        HubManagerConfigBuilder::default()
    }
}

/// Builder for [`HubManagerConfig`].
#[derive(Debug, Default)]
pub struct HubManagerConfigBuilder {
    idle_timeout: Option<Duration>,
    max_hubs: Option<usize>,
    replay_capacity: Option<usize>,
}

impl HubManagerConfigBuilder {
    /// Sets the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of live hubs.
    #[must_use]
    pub fn max_hubs(mut self, max: usize) -> Self {
        self.max_hubs = Some(max);
        self
    }

    /// Sets the replay window of each hub.
    #[must_use]
    pub fn replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = Some(capacity);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> HubManagerConfig {
        HubManagerConfig {
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            max_hubs: self.max_hubs.unwrap_or(DEFAULT_MAX_HUBS).max(1),
            replay: ReplayConfig::with_capacity(
                self.replay_capacity.unwrap_or(DEFAULT_REPLAY_CAPACITY),
            ),
        }
    }
}
