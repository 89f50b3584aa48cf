//! Delta-tracking list.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::change::{CollectionKind, ListChange};
use super::tracked::TrackedCore;
use super::DeltaSource;
use crate::observable::Subscription;

/// A `Vec`-backed list that logs every mutation as a [`ListChange`].
///
/// `TrackedList` is a handle: cloning it yields another handle to the same
/// list, so a list stored in an [`Observable`](crate::Observable) can be
/// mutated through the value returned by `get()`.
///
/// Records are exact enough to replay: applying the log in order to an
/// empty `Vec` reproduces the list's contents and order.
pub struct TrackedList<E> {
    core: Arc<TrackedCore<Vec<E>, ListChange<E>>>,
}

impl<E: Clone + Send + Sync + 'static> TrackedList<E> {
    /// Creates an empty list with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    // -- mutators --------------------------------------------------------

    /// Appends `item`, logging `ADD` at the previous length.
    pub fn push(&self, item: E) {
        self.core.mutate(|data, log| {
            log.push(ListChange::add(data.len(), item.clone()));
            data.push(item);
        });
    }

    /// Inserts `item` at `index`, logging `ADD` at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`, like [`Vec::insert`]. Nothing is logged in
    /// that case.
    pub fn insert(&self, index: usize, item: E) {
        self.core.mutate(|data, log| {
            assert!(
                index <= data.len(),
                "insertion index (is {index}) should be <= len (is {})",
                data.len()
            );
            log.push(ListChange::add(index, item.clone()));
            data.insert(index, item);
        });
    }

    /// Removes the element at `index`, logging `REMOVE` at `index`.
    ///
    /// Returns `None` and logs nothing if `index` is out of bounds.
    pub fn remove(&self, index: usize) -> Option<E> {
        self.core.mutate(|data, log| {
            (index < data.len()).then(|| {
                log.push(ListChange::remove(index));
                data.remove(index)
            })
        })
    }

    /// Removes the first element equal to `item`. Logs exactly one `REMOVE`
    /// at the resolved index.
    pub fn remove_item(&self, item: &E) -> bool
    where
        E: PartialEq,
    {
        self.core.mutate(|data, log| {
            let Some(index) = data.iter().position(|e| e == item) else {
                return false;
            };
            log.push(ListChange::remove(index));
            data.remove(index);
            true
        })
    }

    /// Replaces the element at `index`, logging `SET` with the new value.
    ///
    /// Returns the previous element, or `None` (logging nothing) when `index`
    /// is out of bounds.
    pub fn set(&self, index: usize, item: E) -> Option<E> {
        self.core.mutate(|data, log| {
            let slot = data.get_mut(index)?;
            log.push(ListChange::set(index, item.clone()));
            Some(std::mem::replace(slot, item))
        })
    }

    /// Removes every element. Logs one `CLEAR` if the list was non-empty and
    /// nothing otherwise.
    pub fn clear(&self) {
        self.core.mutate(|data, log| {
            if !data.is_empty() {
                data.clear();
                log.push(ListChange::clear());
            }
        });
    }

    /// Removes every element matching `pred`, walking from tail to head so
    /// each logged `REMOVE` index is valid at the moment it is applied.
    ///
    /// Returns the number of removed elements.
    pub fn remove_if(&self, mut pred: impl FnMut(&E) -> bool) -> usize {
        self.core.mutate(|data, log| {
            let mut removed = 0;
            for index in (0..data.len()).rev() {
                if pred(&data[index]) {
                    log.push(ListChange::remove(index));
                    data.remove(index);
                    removed += 1;
                }
            }
            removed
        })
    }

    /// Appends every item, logging one `ADD` per element.
    pub fn extend(&self, items: impl IntoIterator<Item = E>) {
        self.core.mutate(|data, log| {
            for item in items {
                log.push(ListChange::add(data.len(), item.clone()));
                data.push(item);
            }
        });
    }

    /// Removes every element contained in `items`. One `REMOVE` per element.
    pub fn remove_all(&self, items: &[E]) -> usize
    where
        E: PartialEq,
    {
        self.remove_if(|e| items.contains(e))
    }

    /// Keeps only the elements contained in `items`. One `REMOVE` per
    /// dropped element.
    pub fn retain_all(&self, items: &[E]) -> usize
    where
        E: PartialEq,
    {
        self.remove_if(|e| !items.contains(e))
    }

    /// Re-logs the element at `index` as a `SET` after it was mutated in
    /// place. Returns `false` if `index` is out of bounds.
    pub fn touch(&self, index: usize) -> bool {
        self.core.mutate(|data, log| match data.get(index) {
            Some(current) => {
                log.push(ListChange::set(index, current.clone()));
                true
            }
            None => false,
        })
    }

    /// Mutates the element at `index` in place and logs a `SET` with the
    /// result. Returns `false` if `index` is out of bounds.
    pub fn modify(&self, index: usize, f: impl FnOnce(&mut E)) -> bool {
        self.core.mutate(|data, log| match data.get_mut(index) {
            Some(slot) => {
                f(slot);
                log.push(ListChange::set(index, slot.clone()));
                true
            }
            None => false,
        })
    }

    // -- reads -----------------------------------------------------------

    /// Returns a clone of the element at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<E> {
        self.core.read(|data| data.get(index).cloned())
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.read(Vec::len)
    }

    /// Returns `true` if the list holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.read(Vec::is_empty)
    }

    /// Index of the first element equal to `item`.
    #[must_use]
    pub fn index_of(&self, item: &E) -> Option<usize>
    where
        E: PartialEq,
    {
        self.core.read(|data| data.iter().position(|e| e == item))
    }

    /// Returns `true` if some element equals `item`.
    #[must_use]
    pub fn contains(&self, item: &E) -> bool
    where
        E: PartialEq,
    {
        self.core.read(|data| data.contains(item))
    }

    /// Copies the contents out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<E> {
        self.core.read(Clone::clone)
    }

    /// Runs `f` against the contents without copying them.
    pub fn with<R>(&self, f: impl FnOnce(&[E]) -> R) -> R {
        self.core.read(|data| f(data))
    }

    // -- change log ------------------------------------------------------

    /// Returns the pending log and empties it atomically.
    #[must_use]
    pub fn drain_changes(&self) -> Vec<ListChange<E>> {
        self.core.drain()
    }

    /// Copies the pending log without clearing it.
    #[must_use]
    pub fn pending_changes(&self) -> Vec<ListChange<E>> {
        self.core.pending()
    }

    /// Discards the pending log.
    pub fn clear_changes(&self) {
        self.core.clear_log();
    }

    /// Returns `true` iff the pending log is non-empty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.core.is_dirty()
    }

    /// Registers a delta listener that receives the records of every
    /// mutation, in log order.
    pub fn subscribe(
        &self,
        listener: impl Fn(&[ListChange<E>]) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.subscribe(Arc::new(listener))
    }

    /// Drops every delta listener.
    pub fn clear_listeners(&self) {
        self.core.clear_listeners();
    }

    /// Number of delta listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.core.listener_count()
    }

    /// Returns `true` if both handles refer to the same list.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<E: Clone + Serialize + Send + Sync + 'static> DeltaSource for TrackedList<E> {
    type Record = ListChange<E>;

    const KIND: CollectionKind = CollectionKind::List;

    fn forward_records(
        &self,
        listener: Arc<dyn Fn(&[Self::Record]) + Send + Sync>,
    ) -> Subscription {
        TrackedCore::subscribe_consuming(&self.core, listener)
    }

    fn instance_id(&self) -> usize {
        Arc::as_ptr(&self.core).cast::<()>() as usize
    }
}

impl<E> Clone for TrackedList<E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> Default for TrackedList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync + 'static> From<Vec<E>> for TrackedList<E> {
    fn from(items: Vec<E>) -> Self {
        Self {
            core: Arc::new(TrackedCore::new(items)),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> FromIterator<E> for TrackedList<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<E: Clone + PartialEq + Send + Sync + 'static> PartialEq for TrackedList<E> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || other.with(|theirs| self.to_vec() == theirs)
    }
}

impl<E: fmt::Debug + Clone + Send + Sync + 'static> fmt::Debug for TrackedList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|items| f.debug_list().entries(items).finish())
    }
}

impl<E: Serialize + Clone + Send + Sync + 'static> Serialize for TrackedList<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|items| items.serialize(serializer))
    }
}

impl<'de, E: Deserialize<'de> + Clone + Send + Sync + 'static> Deserialize<'de> for TrackedList<E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<E>::deserialize(deserializer).map(Self::from)
    }
}
