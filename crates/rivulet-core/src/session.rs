//! Session sinks and the fan-out set shared by the broadcast core and the
//! replay hub.
//!
//! A [`SessionSink`] is whatever transport endpoint can take an encoded
//! message: a WebSocket, an SSE stream, a test recorder. [`SessionSet`] holds
//! the live sinks of one core and guarantees that sends to one session never
//! interleave, while sends to different sessions proceed independently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

/// Transport failure for one session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was already closed.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// The transport rejected the message.
    #[error("send to session {id} failed: {reason}")]
    Send {
        /// Session id.
        id: SessionId,
        /// Transport-specific reason.
        reason: String,
    },
}

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw id.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Transport-agnostic endpoint for encoded messages.
pub trait SessionSink: Send + Sync {
    /// Stable id of this session.
    fn id(&self) -> SessionId;

    /// Returns `false` once the transport is gone.
    fn is_open(&self) -> bool;

    /// Sends one encoded message.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the message could not be delivered; the
    /// caller then treats the session as closed.
    fn send(&self, text: &str) -> Result<(), SessionError>;

    /// Closes the transport. Must be idempotent.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// SessionSet
// ---------------------------------------------------------------------------

struct SessionSlot {
    sink: Arc<dyn SessionSink>,
    send_lock: Mutex<()>,
}

impl SessionSlot {
    fn send(&self, text: &str) -> Result<(), SessionError> {
        let _serial = self.send_lock.lock();
        if !self.sink.is_open() {
            return Err(SessionError::Closed(self.sink.id()));
        }
        self.sink.send(text)
    }
}

/// Live sessions of one core.
#[derive(Default)]
pub struct SessionSet {
    slots: RwLock<FxHashMap<SessionId, Arc<SessionSlot>>>,
}

impl SessionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a session.
    pub fn insert(&self, sink: Arc<dyn SessionSink>) {
        let id = sink.id();
        self.slots.write().insert(
            id,
            Arc::new(SessionSlot {
                sink,
                send_lock: Mutex::new(()),
            }),
        );
    }

    /// Removes a session. Returns `true` if it was present.
    pub fn remove(&self, id: SessionId) -> bool {
        self.slots.write().remove(&id).is_some()
    }

    /// Removes a session and returns its sink.
    pub fn take(&self, id: SessionId) -> Option<Arc<dyn SessionSink>> {
        self.slots.write().remove(&id).map(|slot| Arc::clone(&slot.sink))
    }

    /// Returns `true` if the session is present.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.slots.read().contains_key(&id)
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` if no session is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Sends to one session, serialized with every other send to it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] for an unknown or closed session, or
    /// the transport's error.
    pub fn send_to(&self, id: SessionId, text: &str) -> Result<(), SessionError> {
        let slot = self
            .slots
            .read()
            .get(&id)
            .cloned()
            .ok_or(SessionError::Closed(id))?;
        slot.send(text)
    }

    /// Sends `text` to every session. Sessions that are closed or whose send
    /// fails are removed.
    ///
    /// Returns `(delivered, pruned)`.
    pub fn broadcast(&self, text: &str) -> (usize, usize) {
        let slots: Vec<Arc<SessionSlot>> = self.slots.read().values().cloned().collect();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for slot in slots {
            match slot.send(text) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("dropping session after failed send: {e}");
                    failed.push(slot.sink.id());
                }
            }
        }
        if !failed.is_empty() {
            let mut map = self.slots.write();
            for id in &failed {
                map.remove(id);
            }
        }
        (delivered, failed.len())
    }

    /// Closes and removes every session.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.slots.write().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.sink.close();
        }
    }
}

impl fmt::Debug for SessionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSet")
            .field("sessions", &self.len())
            .finish()
    }
}
