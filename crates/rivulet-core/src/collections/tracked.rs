//! Shared machinery behind the three tracked containers.
//!
//! Every tracked container is a handle to one [`TrackedCore`]:
//!
//! ```text
//! delivery: ReentrantMutex<()>       ordering of notifications per instance
//!   └── state: Mutex<{data, log}>    container + pending change log
//! listeners: DeltaListeners<C>       copy-on-write, panic-isolated
//! ```
//!
//! A mutation takes the delivery lock, then the state lock, mutates the
//! container and appends its records in the same critical section, releases
//! the state lock and finally hands the new records to the delta listeners
//! while still holding the delivery lock. Listeners therefore observe records
//! in log order even when mutations race on different threads, and may read
//! or mutate the same container re-entrantly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::observable::Subscription;

pub(crate) type DeltaListener<C> = Arc<dyn Fn(&[C]) + Send + Sync>;

// ---------------------------------------------------------------------------
// DeltaListeners
// ---------------------------------------------------------------------------

pub(crate) struct DeltaListeners<C> {
    entries: RwLock<Arc<[(u64, DeltaListener<C>)]>>,
    next_id: AtomicU64,
}

impl<C: 'static> DeltaListeners<C> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn add(self: &Arc<Self>, listener: DeltaListener<C>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries.write();
            let mut next: Vec<_> = entries.iter().cloned().collect();
            next.push((id, listener));
            *entries = Arc::from(next);
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.remove(id);
            }
        })
    }

    fn remove(&self, id: u64) {
        let mut entries = self.entries.write();
        if entries.iter().any(|(lid, _)| *lid == id) {
            *entries = entries
                .iter()
                .filter(|(lid, _)| *lid != id)
                .cloned()
                .collect();
        }
    }

    fn clear(&self) {
        *self.entries.write() = Arc::from(Vec::new());
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Delivers `records` to every listener; a panicking listener is logged
    /// and skipped.
    fn notify(&self, records: &[C]) {
        let snapshot = Arc::clone(&*self.entries.read());
        for (id, listener) in snapshot.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(records))).is_err() {
                tracing::warn!(listener = id, "delta listener panicked, continuing");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TrackedCore
// ---------------------------------------------------------------------------

struct TrackedState<S, C> {
    data: S,
    log: Vec<C>,
}

pub(crate) struct TrackedCore<S, C> {
    delivery: ReentrantMutex<()>,
    state: Mutex<TrackedState<S, C>>,
    listeners: Arc<DeltaListeners<C>>,
}

impl<S, C: Clone + 'static> TrackedCore<S, C> {
    pub(crate) fn new(data: S) -> Self {
        Self {
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(TrackedState {
                data,
                log: Vec::new(),
            }),
            listeners: Arc::new(DeltaListeners::new()),
        }
    }

    /// Runs `f` with the container and the pending log, then notifies the
    /// listeners of every record `f` appended.
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut S, &mut Vec<C>) -> R) -> R {
        let _delivery = self.delivery.lock();
        let (result, fresh) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let start = state.log.len();
            let result = f(&mut state.data, &mut state.log);
            (result, state.log[start..].to_vec())
        };
        if !fresh.is_empty() {
            self.listeners.notify(&fresh);
        }
        result
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.state.lock().data)
    }

    /// Takes the pending log and leaves it empty, atomically with respect to
    /// every mutator.
    pub(crate) fn drain(&self) -> Vec<C> {
        std::mem::take(&mut self.state.lock().log)
    }

    pub(crate) fn pending(&self) -> Vec<C> {
        self.state.lock().log.clone()
    }

    pub(crate) fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub(crate) fn is_dirty(&self) -> bool {
        !self.state.lock().log.is_empty()
    }

    pub(crate) fn subscribe(&self, listener: DeltaListener<C>) -> Subscription {
        self.listeners.add(listener)
    }

    /// Like [`subscribe`](Self::subscribe), but empties the pending log after
    /// each delivery. Holds the core weakly so the listener never keeps the
    /// container alive.
    pub(crate) fn subscribe_consuming(this: &Arc<Self>, listener: DeltaListener<C>) -> Subscription
    where
        S: Send + 'static,
        C: Send,
    {
        let weak = Arc::downgrade(this);
        this.listeners.add(Arc::new(move |records: &[C]| {
            listener(records);
            if let Some(core) = weak.upgrade() {
                core.clear_log();
            }
        }))
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.clear();
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
