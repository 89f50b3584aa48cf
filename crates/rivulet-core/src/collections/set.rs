//! Delta-tracking set.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::change::{CollectionKind, SetChange};
use super::tracked::TrackedCore;
use super::DeltaSource;
use crate::observable::Subscription;

/// A `HashSet`-backed set that logs every effective mutation as a
/// [`SetChange`]. Inserting a present element or removing an absent one logs
/// nothing.
pub struct TrackedSet<E> {
    core: Arc<TrackedCore<HashSet<E>, SetChange<E>>>,
}

impl<E: Eq + Hash + Clone + Send + Sync + 'static> TrackedSet<E> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::from(HashSet::new())
    }

    /// Inserts `item`, logging `ADD` only if it was not present.
    pub fn insert(&self, item: E) -> bool {
        self.core.mutate(|data, log| {
            let added = data.insert(item.clone());
            if added {
                log.push(SetChange::add(item));
            }
            added
        })
    }

    /// Removes `item`, logging `REMOVE` only if it was present.
    pub fn remove(&self, item: &E) -> bool {
        self.core.mutate(|data, log| {
            let removed = data.remove(item);
            if removed {
                log.push(SetChange::remove(item.clone()));
            }
            removed
        })
    }

    /// Removes every element. Logs one `CLEAR` if the set was non-empty.
    pub fn clear(&self) {
        self.core.mutate(|data, log| {
            if !data.is_empty() {
                data.clear();
                log.push(SetChange::clear());
            }
        });
    }

    /// Inserts every item; one `ADD` per newly inserted element.
    pub fn extend(&self, items: impl IntoIterator<Item = E>) {
        self.core.mutate(|data, log| {
            for item in items {
                if data.insert(item.clone()) {
                    log.push(SetChange::add(item));
                }
            }
        });
    }

    /// Removes every element contained in `items`; one `REMOVE` per removed
    /// element.
    pub fn remove_all<'a>(&self, items: impl IntoIterator<Item = &'a E>) -> usize
    where
        E: 'a,
    {
        self.core.mutate(|data, log| {
            let mut removed = 0;
            for item in items {
                if data.remove(item) {
                    log.push(SetChange::remove(item.clone()));
                    removed += 1;
                }
            }
            removed
        })
    }

    /// Re-logs a present element as `REMOVE` followed by `ADD`, for elements
    /// whose contents changed without affecting their hash. Returns `false`
    /// if `item` is absent.
    pub fn touch(&self, item: &E) -> bool {
        self.core.mutate(|data, log| {
            if !data.contains(item) {
                return false;
            }
            log.push(SetChange::remove(item.clone()));
            log.push(SetChange::add(item.clone()));
            true
        })
    }

    /// Returns `true` if `item` is present.
    #[must_use]
    pub fn contains(&self, item: &E) -> bool {
        self.core.read(|data| data.contains(item))
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.read(HashSet::len)
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.read(HashSet::is_empty)
    }

    /// Copies the contents out.
    #[must_use]
    pub fn to_set(&self) -> HashSet<E> {
        self.core.read(Clone::clone)
    }

    /// Runs `f` against the contents without copying them.
    pub fn with<R>(&self, f: impl FnOnce(&HashSet<E>) -> R) -> R {
        self.core.read(f)
    }

    /// Returns the pending log and empties it atomically.
    #[must_use]
    pub fn drain_changes(&self) -> Vec<SetChange<E>> {
        self.core.drain()
    }

    /// Copies the pending log without clearing it.
    #[must_use]
    pub fn pending_changes(&self) -> Vec<SetChange<E>> {
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

    /// Registers a delta listener.
    pub fn subscribe(
        &self,
        listener: impl Fn(&[SetChange<E>]) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.subscribe(Arc::new(listener))
    }

    /// Drops every delta listener.
    pub fn clear_listeners(&self) {
        self.core.clear_listeners();
    }

    /// Returns `true` if both handles refer to the same set.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<E> DeltaSource for TrackedSet<E>
where
    E: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
{
    type Record = SetChange<E>;

    const KIND: CollectionKind = CollectionKind::Set;

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

impl<E> Clone for TrackedSet<E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<E: Eq + Hash + Clone + Send + Sync + 'static> Default for TrackedSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Eq + Hash + Clone + Send + Sync + 'static> From<HashSet<E>> for TrackedSet<E> {
    fn from(items: HashSet<E>) -> Self {
        Self {
            core: Arc::new(TrackedCore::new(items)),
        }
    }
}

impl<E: Eq + Hash + Clone + Send + Sync + 'static> FromIterator<E> for TrackedSet<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<HashSet<_>>())
    }
}

impl<E: Eq + Hash + Clone + Send + Sync + 'static> PartialEq for TrackedSet<E> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || other.with(|theirs| self.to_set() == *theirs)
    }
}

impl<E: fmt::Debug + Eq + Hash + Clone + Send + Sync + 'static> fmt::Debug for TrackedSet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|items| f.debug_set().entries(items.iter()).finish())
    }
}

impl<E: Serialize + Eq + Hash + Clone + Send + Sync + 'static> Serialize for TrackedSet<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|items| items.serialize(serializer))
    }
}

impl<'de, E> Deserialize<'de> for TrackedSet<E>
where
    E: Deserialize<'de> + Eq + Hash + Clone + Send + Sync + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashSet::<E>::deserialize(deserializer).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::super::change::SetOp;
    use super::*;

    #[test]
    fn test_add_and_remove_only_effective() {
        let set = TrackedSet::new();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.remove(&"a"));
        assert!(!set.remove(&"a"));

        let ops: Vec<_> = set.drain_changes().into_iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![SetOp::Add, SetOp::Remove]);
    }

    #[test]
    fn test_clear_only_when_non_empty() {
        let set: TrackedSet<u8> = TrackedSet::new();
        set.clear();
        assert!(!set.is_dirty());

        set.extend([1, 2, 2, 3]);
        assert_eq!(set.drain_changes().len(), 3);
        set.clear();
        assert_eq!(set.drain_changes(), vec![SetChange::clear()]);
    }

    #[test]
    fn test_touch_emits_remove_then_add() {
        let set: TrackedSet<u8> = [4].into_iter().collect();
        assert!(set.touch(&4));
        assert!(!set.touch(&5));
        assert_eq!(
            set.drain_changes(),
            vec![SetChange::remove(4), SetChange::add(4)]
        );
        assert!(set.contains(&4));
    }

    #[test]
    fn test_remove_all_counts_effective_removals() {
        let set: TrackedSet<u8> = [1, 2, 3].into_iter().collect();
        assert_eq!(set.remove_all(&[1, 3, 9]), 2);
        assert_eq!(set.drain_changes().len(), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_replay_reproduces_contents() {
        let set = TrackedSet::new();
        set.extend(["a", "b", "c"]);
        set.remove(&"b");
        let mut replay = HashSet::new();
        for record in set.drain_changes() {
            assert!(record.apply(&mut replay));
        }
        assert_eq!(replay, set.to_set());
    }
}
