//! # Rivulet Core
//!
//! Reactive state synchronization engine: keeps server-held mutable state
//! and any number of remote subscribers consistent with minimal traffic.
//!
//! This crate provides:
//! - **Observable**: single-value cells with change notification and an
//!   activity guard
//! - **Collections**: list/map/set containers that log every mutation as a
//!   compact change record
//! - **Binding**: a flattened `key -> variable` registry built from a tree of
//!   owner nodes, plus guarded deep-path writes
//! - **Broadcast**: the push core that encodes, coalesces and fans out changes
//!   to live sessions
//! - **Replay**: the sequenced, bounded-history hub for pull transports, and
//!   a manager that keys hubs by session and scope
//!
//! ## Data Flow
//!
//! ```text
//! Observable::set / TrackedList::push
//!        │ notification
//!        ▼
//! BroadcastCore ──► PendingQueue ──flush──► coalesce ──► Codec ──► SessionSink*
//! ReplayHub     ──► sequence + ReplayBuffer ───────────► Codec ──► SessionSink*
//!        ▲
//!        └── on_message / set  ◄── {k, v} from a client
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use rivulet_core::binding::{Binding, BindingRegistry, OwnerTree};
//! use rivulet_core::broadcast::{BroadcastConfig, BroadcastCore};
//! use rivulet_core::observable::Observable;
//! use rivulet_core::scheduler::TokioScheduler;
//!
//! let tree = OwnerTree::new("page").bind("count", Binding::value(Observable::new(0)));
//! let registry = BindingRegistry::from_tree(&tree)?;
//! let core = BroadcastCore::builder(registry)
//!     .scheduler(Arc::new(TokioScheduler::current()))
//!     .config(BroadcastConfig::default())
//!     .build();
//! core.on_open(session, None, 0)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod binding;
pub mod broadcast;
pub mod collections;
pub mod observable;
pub mod protocol;
pub mod replay;
pub mod scheduler;
pub mod session;

mod watch;

// Re-export key types
pub use binding::{Binding, BindingRegistry, OwnerNode, OwnerTree, WriteOutcome};
pub use broadcast::{BroadcastConfig, BroadcastCore};
pub use collections::{TrackedList, TrackedMap, TrackedSet};
pub use observable::{Observable, Subscription};
pub use replay::{HubManager, ReplayConfig, ReplayHub};

/// Result type for rivulet-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rivulet-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registry assembly errors
    #[error("Registry error: {0}")]
    Registry(#[from] binding::RegistryError),

    /// Inbound write errors
    #[error("Write error: {0}")]
    Write(#[from] binding::WriteError),

    /// Encode/decode errors
    #[error("Codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    /// Session transport errors
    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    /// No live hub for the given session and scope
    #[error("No hub for session '{session}' scope '{scope}'")]
    HubNotFound {
        /// Session id.
        session: String,
        /// Scope name.
        scope: String,
    },
}
