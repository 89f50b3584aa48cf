//! Observable variables: single-value cells with change notification.
//!
//! [`Observable<T>`] stores one value behind a `parking_lot::RwLock` and keeps
//! an ordered, copy-on-write list of listeners. Cloning an `Observable` yields
//! another handle to the **same** cell, which is how bindings share a variable
//! by reference with the sync engine.
//!
//! # Invariants
//!
//! 1. [`get()`](Observable::get) always returns the latest stored value. The
//!    activity guard only suppresses listener delivery, never storage.
//! 2. Listeners run synchronously in registration order, outside every lock,
//!    with the value that was stored by the triggering `set`.
//! 3. Storing a value and snapshotting the listener list happen under the
//!    value's write lock, so a listener registered after a `set` returns never
//!    sees that `set`.
//! 4. A panicking listener is a caller bug: the panic propagates to the
//!    thread that called `set`.
//!
//! # Example
//!
//! ```rust
//! use rivulet_core::Observable;
//!
//! let counter = Observable::new(0);
//! let sub = counter.on_change(|v| println!("now {v}"));
//! counter.set(1);
//! drop(sub); // removes the listener
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ActiveGuard = Arc<dyn Fn() -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Capability returned by every listener registration in this crate.
///
/// Dropping the subscription removes the listener. [`unsubscribe`] does the
/// same explicitly and is idempotent. Call [`detach`] to keep the listener
/// registered for the lifetime of its source.
///
/// [`unsubscribe`]: Subscription::unsubscribe
/// [`detach`]: Subscription::detach
#[must_use = "dropping a Subscription removes its listener"]
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Wraps a cancellation callback, run at most once on
    /// [`unsubscribe`](Self::unsubscribe) or drop.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Removes the listener. Calling this more than once has no effect.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel();
        }
    }

    /// Returns `true` until the listener has been removed through this handle.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Consumes the handle without removing the listener.
    pub fn detach(mut self) {
        *self.cancel.get_mut() = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Observable
// ---------------------------------------------------------------------------

struct Inner<T> {
    value: RwLock<T>,
    listeners: RwLock<Arc<[(u64, Listener<T>)]>>,
    guard: RwLock<Option<ActiveGuard>>,
    next_listener: AtomicU64,
    version: AtomicU64,
}

impl<T> Inner<T> {
    fn remove_listener(&self, id: u64) {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|(lid, _)| *lid == id) {
            *listeners = listeners
                .iter()
                .filter(|(lid, _)| *lid != id)
                .cloned()
                .collect();
        }
    }

    fn is_active(&self) -> bool {
        let guard = self.guard.read().clone();
        guard.map_or(true, |guard| guard())
    }
}

/// A thread-safe observable value.
///
/// See the [module documentation](self) for the invariants.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.inner.value.read())
            .field("version", &self.inner.version.load(Ordering::Relaxed))
            .field("listeners", &self.inner.listeners.read().len())
            .finish()
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// Creates an observable holding `value`, with no listeners and a guard
    /// that is always active.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(value),
                listeners: RwLock::new(Arc::from(Vec::new())),
                guard: RwLock::new(None),
                next_listener: AtomicU64::new(1),
                version: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Runs `f` against the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Stores `value` and, if the activity guard allows it, notifies every
    /// listener in registration order.
    ///
    /// # Panics
    ///
    /// Propagates a panic raised by a listener.
    pub fn set(&self, value: T) {
        {
            let mut slot = self.inner.value.write();
            *slot = value.clone();
            self.inner.version.fetch_add(1, Ordering::AcqRel);
        }
        // The guard may read this observable, so it runs unlocked.
        if !self.inner.is_active() {
            return;
        }
        let listeners = Arc::clone(&*self.inner.listeners.read());
        for (_, listener) in listeners.iter() {
            listener(&value);
        }
    }

    /// Mutates the value in place and notifies listeners with the result.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let _ = self.try_update(|value| {
            f(value);
            Ok::<_, std::convert::Infallible>(true)
        });
    }

    /// Mutates the value in place; listeners are notified only when `f`
    /// returns `Ok(true)`.
    ///
    /// The value is never rolled back: `f` is responsible for leaving it
    /// untouched when it reports `Ok(false)` or an error.
    ///
    /// # Errors
    ///
    /// Returns whatever error `f` returns.
    pub fn try_update<E>(&self, f: impl FnOnce(&mut T) -> Result<bool, E>) -> Result<bool, E> {
        let value = {
            let mut slot = self.inner.value.write();
            if !f(&mut slot)? {
                return Ok(false);
            }
            self.inner.version.fetch_add(1, Ordering::AcqRel);
            slot.clone()
        };
        if !self.inner.is_active() {
            return Ok(true);
        }
        let listeners = Arc::clone(&*self.inner.listeners.read());
        for (_, listener) in listeners.iter() {
            listener(&value);
        }
        Ok(true)
    }

    /// Registers a change listener.
    ///
    /// The listener stays registered while the returned [`Subscription`] is
    /// alive (or forever after [`Subscription::detach`]).
    pub fn on_change(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.inner.listeners.write();
            let mut next: Vec<(u64, Listener<T>)> = listeners.iter().cloned().collect();
            next.push((id, Arc::new(listener)));
            *listeners = Arc::from(next);
        }
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_listener(id);
            }
        })
    }

    /// Installs or replaces the activity guard.
    ///
    /// While the guard returns `false`, `set` still stores values but no
    /// listener runs. Use it to silence background mutations on an owner that
    /// is not currently live.
    pub fn set_active_guard(&self, guard: impl Fn() -> bool + Send + Sync + 'static) {
        *self.inner.guard.write() = Some(Arc::new(guard));
    }

    /// Removes the activity guard, making the observable always active.
    pub fn clear_active_guard(&self) {
        *self.inner.guard.write() = None;
    }

    /// Returns `true` if listeners would currently be notified.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Drops every listener.
    ///
    /// Safe to call while a notification is in flight: listeners already
    /// snapshotted by that notification may still run once.
    pub fn clear_listeners(&self) {
        *self.inner.listeners.write() = Arc::from(Vec::new());
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Number of values stored since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Returns `true` if both handles point at the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity of the underlying cell, used for duplicate detection.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>() as usize
    }
}

// ===========================================================================
// Tests
// ===========================================================================
