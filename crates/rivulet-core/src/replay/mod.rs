//! # Replay
//!
//! Sequenced, bounded-history broadcast for clients that reconnect or pull.
//!
//! - [`ReplayHub`]: numbers every change of one registry, retains the newest
//!   ones and answers `poll(since)` with exactly what a client missed, or a
//!   full snapshot when the gap is no longer covered.
//! - [`HubManager`]: keeps hubs alive per `(session, scope)` with idle and
//!   size-based eviction, and serves the pull surface (`poll`, `set`).
//! - [`MessageBroker`]: relays encoded envelopes between nodes that serve
//!   the same sessions.
//!
//! ## Poll Semantics
//!
//! | `since`                          | result                                  |
//! |----------------------------------|-----------------------------------------|
//! | `0`                              | full snapshot, current sequence         |
//! | greater than current             | full snapshot, current sequence         |
//! | older than the retained window   | full snapshot, current sequence         |
//! | otherwise                        | changes after `since`, newest sequence  |

mod broker;
mod buffer;
mod config;
mod hub;
mod manager;

pub use broker::{BrokerError, BrokerHandler, InMemoryBroker, InMemoryBus, MessageBroker};
pub use buffer::{ReplayBuffer, SequencedMessage};
pub use config::{
    HubManagerConfig, HubManagerConfigBuilder, ReplayConfig, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_HUBS, DEFAULT_REPLAY_CAPACITY, MIN_REPLAY_CAPACITY,
};
pub use hub::{ReplayHub, ReplayHubBuilder};
pub use manager::{HubManager, HubManagerBuilder};
