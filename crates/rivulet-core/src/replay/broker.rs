//! Cross-process relay of encoded envelopes.
//!
//! A hub built with a broker publishes every envelope under its session id.
//! Other nodes subscribed to the same broker hand the message to their own
//! hubs of that session, which forward it verbatim to their sinks. A broker
//! never delivers a message back to the node that published it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::observable::Subscription;

/// Callback receiving `(session_id, message)` from remote nodes.
pub type BrokerHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Broker failures. Hubs log them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker has shut down.
    #[error("broker is closed")]
    Closed,

    /// The transport rejected the message.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Pub/sub transport between nodes serving the same sessions.
pub trait MessageBroker: Send + Sync + 'static {
    /// Publishes an encoded message for `session`.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the message could not be handed over.
    fn publish(&self, session: &str, message: &str) -> Result<(), BrokerError>;

    /// Registers a handler for messages published by other nodes.
    fn on_message(&self, handler: BrokerHandler) -> Subscription;
}

// ---------------------------------------------------------------------------
// InMemoryBus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    next_handler: AtomicU64,
    handlers: RwLock<FxHashMap<u64, (u64, BrokerHandler)>>,
}

/// In-process bus connecting any number of [`InMemoryBroker`] nodes.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<BusState>,
    next_node: Arc<AtomicU64>,
}

impl InMemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a node attached to this bus.
    #[must_use]
    pub fn broker(&self) -> InMemoryBroker {
        InMemoryBroker {
            node: self.next_node.fetch_add(1, Ordering::Relaxed),
            bus: Arc::clone(&self.state),
        }
    }
}

impl fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("handlers", &self.state.handlers.read().len())
            .finish()
    }
}

/// One node on an [`InMemoryBus`].
#[derive(Clone)]
pub struct InMemoryBroker {
    node: u64,
    bus: Arc<BusState>,
}

impl InMemoryBroker {
    /// Node id on the bus.
    #[must_use]
    pub fn node(&self) -> u64 {
        self.node
    }
}

impl MessageBroker for InMemoryBroker {
    fn publish(&self, session: &str, message: &str) -> Result<(), BrokerError> {
        let targets: Vec<BrokerHandler> = self
            .bus
            .handlers
            .read()
            .values()
            .filter(|(node, _)| *node != self.node)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in targets {
            handler(session, message);
        }
        Ok(())
    }

    fn on_message(&self, handler: BrokerHandler) -> Subscription {
        let id = self.bus.next_handler.fetch_add(1, Ordering::Relaxed);
        self.bus.handlers.write().insert(id, (self.node, handler));
        let bus: Weak<BusState> = Arc::downgrade(&self.bus);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.handlers.write().remove(&id);
            }
        })
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}
