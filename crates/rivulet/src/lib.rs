//! # Rivulet
//!
//! Keeps server-held mutable state and any number of remote subscribers
//! consistent with minimal traffic.
//!
//! Bind observable variables and delta-tracking collections into a registry,
//! then hand the registry to a push core (one live session per client) or a
//! replay hub (sequenced history for pull transports).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rivulet::prelude::*;
//!
//! let todos = TrackedList::from(vec!["write docs".to_string()]);
//! let tree = OwnerTree::new("page")
//!     .bind("count", Binding::value(Observable::new(0)))
//!     .bind("todos", Binding::tracked(Observable::new(todos.clone())));
//!
//! let hub = ReplayHub::new(BindingRegistry::from_tree(&tree)?);
//! let first = hub.poll(0); // snapshot of every key
//!
//! todos.push("ship it".to_string());
//! hub.set("count", &json!(5))?;
//! let missed = hub.poll(first.seq); // one list delta, one snapshot
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export the engine
pub use rivulet_core::*;

/// Commonly used types and traits.
///
/// ```rust,ignore
/// use rivulet::prelude::*;
/// ```
pub mod prelude {
    // Variables and collections
    pub use rivulet_core::collections::{DeltaSource, TrackedList, TrackedMap, TrackedSet};
    pub use rivulet_core::observable::{Observable, Subscription};

    // Binding
    pub use rivulet_core::binding::{
        Binding, BindingRegistry, FieldTable, Navigable, OwnerNode, OwnerTree, WriteError,
        WriteOutcome,
    };

    // Transports
    pub use rivulet_core::broadcast::{BroadcastConfig, BroadcastCore};
    pub use rivulet_core::protocol::{Codec, Entry, Envelope, JsonCodec};
    pub use rivulet_core::replay::{HubManager, HubManagerConfig, ReplayConfig, ReplayHub};
    pub use rivulet_core::scheduler::{Scheduler, TokioScheduler};
    pub use rivulet_core::session::{SessionError, SessionId, SessionSink};

    // Errors
    pub use rivulet_core::{Error, Result};

    // JSON values (commonly needed for writes)
    pub use serde_json::{json, Value};
}
