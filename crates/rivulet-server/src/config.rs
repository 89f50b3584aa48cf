//! Server configuration file.
//!
//! ```toml
//! [broadcast]
//! backpressure = true
//! max_queue_depth = 512
//! flush_interval_ms = 16
//!
//! [replay]
//! capacity = 2000
//! idle_timeout_secs = 600
//! max_hubs = 5000
//!
//! [demo]
//! tick_ms = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use rivulet_core::broadcast::{BroadcastConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_QUEUE_DEPTH};
use rivulet_core::replay::{
    HubManagerConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_HUBS, DEFAULT_REPLAY_CAPACITY,
};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub broadcast: BroadcastSection,
    #[serde(default)]
    pub replay: ReplaySection,
    #[serde(default)]
    pub demo: DemoSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BroadcastSection {
    #[serde(default = "default_true")]
    pub backpressure: bool,
    #[serde(default = "default_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReplaySection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_hubs")]
    pub max_hubs: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DemoSection {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_queue_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}

fn default_flush_interval_ms() -> u64 {
    u64::try_from(DEFAULT_FLUSH_INTERVAL.as_millis()).unwrap_or(16)
}

fn default_capacity() -> usize {
    DEFAULT_REPLAY_CAPACITY
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_max_hubs() -> usize {
    DEFAULT_MAX_HUBS
}

fn default_tick_ms() -> u64 {
    1000
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            backpressure: true,
            max_queue_depth: default_queue_depth(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_hubs: default_max_hubs(),
        }
    }
}

impl Default for DemoSection {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

impl ServerConfig {
    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML format")
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn broadcast(&self) -> BroadcastConfig {
        BroadcastConfig::builder()
            .backpressure(self.broadcast.backpressure)
            .max_queue_depth(self.broadcast.max_queue_depth)
            .flush_interval(Duration::from_millis(self.broadcast.flush_interval_ms))
            .build()
    }

    pub fn hub_manager(&self) -> HubManagerConfig {
        HubManagerConfig::builder()
            .idle_timeout(Duration::from_secs(self.replay.idle_timeout_secs))
            .max_hubs(self.replay.max_hubs)
            .replay_capacity(self.replay.capacity)
            .build()
    }
}
