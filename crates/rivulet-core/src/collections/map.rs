//! Delta-tracking map.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::change::{CollectionKind, MapChange};
use super::tracked::TrackedCore;
use super::DeltaSource;
use crate::observable::Subscription;

/// A `HashMap`-backed map that logs every mutation as a [`MapChange`].
///
/// Like [`TrackedList`](super::TrackedList), cloning yields another handle to
/// the same map.
pub struct TrackedMap<K, V> {
    core: Arc<TrackedCore<HashMap<K, V>, MapChange<K, V>>>,
}

impl<K, V> TrackedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::from(HashMap::new())
    }

    /// Inserts or replaces `key`, logging `PUT`. Returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.core.mutate(|data, log| {
            log.push(MapChange::put(key.clone(), value.clone()));
            data.insert(key, value)
        })
    }

    /// Removes `key`, logging `REMOVE` only if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.core.mutate(|data, log| {
            let old = data.remove(key)?;
            log.push(MapChange::remove(key.clone()));
            Some(old)
        })
    }

    /// Removes every entry. Logs one `CLEAR` if the map was non-empty.
    pub fn clear(&self) {
        self.core.mutate(|data, log| {
            if !data.is_empty() {
                data.clear();
                log.push(MapChange::clear());
            }
        });
    }

    /// Inserts every entry, logging one `PUT` per entry.
    pub fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        self.core.mutate(|data, log| {
            for (key, value) in entries {
                log.push(MapChange::put(key.clone(), value.clone()));
                data.insert(key, value);
            }
        });
    }

    /// Re-logs `key` as a `PUT` with its current value after an in-place
    /// mutation. Returns `false` if the key is absent.
    pub fn touch(&self, key: &K) -> bool {
        self.core.mutate(|data, log| match data.get(key) {
            Some(value) => {
                log.push(MapChange::put(key.clone(), value.clone()));
                true
            }
            None => false,
        })
    }

    /// Returns a clone of the value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.core.read(|data| data.get(key).cloned())
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.core.read(|data| data.contains_key(key))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.read(HashMap::len)
    }

    /// Returns `true` if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.read(HashMap::is_empty)
    }

    /// Copies the contents out.
    #[must_use]
    pub fn to_map(&self) -> HashMap<K, V> {
        self.core.read(Clone::clone)
    }

    /// Runs `f` against the contents without copying them.
    pub fn with<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        self.core.read(f)
    }

    /// Returns the pending log and empties it atomically.
    #[must_use]
    pub fn drain_changes(&self) -> Vec<MapChange<K, V>> {
        self.core.drain()
    }

    /// Copies the pending log without clearing it.
    #[must_use]
    pub fn pending_changes(&self) -> Vec<MapChange<K, V>> {
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
        listener: impl Fn(&[MapChange<K, V>]) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.subscribe(Arc::new(listener))
    }

    /// Drops every delta listener.
    pub fn clear_listeners(&self) {
        self.core.clear_listeners();
    }

    /// Returns `true` if both handles refer to the same map.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<K, V> DeltaSource for TrackedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
{
    type Record = MapChange<K, V>;

    const KIND: CollectionKind = CollectionKind::Map;

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

impl<K, V> Clone for TrackedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K, V> Default for TrackedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> From<HashMap<K, V>> for TrackedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from(entries: HashMap<K, V>) -> Self {
        Self {
            core: Arc::new(TrackedCore::new(entries)),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for TrackedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<HashMap<_, _>>())
    }
}

impl<K, V> PartialEq for TrackedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || other.with(|theirs| self.to_map() == *theirs)
    }
}

impl<K, V> fmt::Debug for TrackedMap<K, V>
where
    K: fmt::Debug + Eq + Hash + Clone + Send + Sync + 'static,
    V: fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|entries| f.debug_map().entries(entries.iter()).finish())
    }
}

impl<K, V> Serialize for TrackedMap<K, V>
where
    K: Serialize + Eq + Hash + Clone + Send + Sync + 'static,
    V: Serialize + Clone + Send + Sync + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|entries| entries.serialize(serializer))
    }
}

impl<'de, K, V> Deserialize<'de> for TrackedMap<K, V>
where
    K: Deserialize<'de> + Eq + Hash + Clone + Send + Sync + 'static,
    V: Deserialize<'de> + Clone + Send + Sync + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::<K, V>::deserialize(deserializer).map(Self::from)
    }
}
