//! Change records logged by the tracked collections.
//!
//! Wire shapes:
//!
//! ```text
//! list: {"op": "ADD"|"REMOVE"|"SET"|"CLEAR", "index": 3, "item": <any>|null}
//! map:  {"op": "PUT"|"REMOVE"|"CLEAR", "key": <any>|null, "value": <any>|null}
//! set:  {"op": "ADD"|"REMOVE"|"CLEAR", "item": <any>|null}
//! ```
//!
//! Each record type also knows how to replay itself onto a plain container,
//! which is what a client does with a delta packet.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Which container family a delta stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// Ordered list.
    List,
    /// Key/value map.
    Map,
    /// Unordered set.
    Set,
}

impl CollectionKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Map => "map",
            Self::Set => "set",
        }
    }
}

impl std::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// List mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListOp {
    /// Insert `item` at `index`.
    Add,
    /// Remove the element at `index`.
    Remove,
    /// Replace the element at `index` with `item`.
    Set,
    /// Remove every element.
    Clear,
}

/// One logged list mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListChange<E> {
    /// Mutation kind.
    pub op: ListOp,
    /// Position the mutation applied to (0 for `CLEAR`).
    pub index: usize,
    /// New element for `ADD`/`SET`, `None` otherwise.
    pub item: Option<E>,
}

impl<E> ListChange<E> {
    /// `ADD` at `index`.
    pub fn add(index: usize, item: E) -> Self {
        Self {
            op: ListOp::Add,
            index,
            item: Some(item),
        }
    }

    /// `REMOVE` at `index`.
    pub fn remove(index: usize) -> Self {
        Self {
            op: ListOp::Remove,
            index,
            item: None,
        }
    }

    /// `SET` at `index`.
    pub fn set(index: usize, item: E) -> Self {
        Self {
            op: ListOp::Set,
            index,
            item: Some(item),
        }
    }

    /// `CLEAR`.
    pub fn clear() -> Self {
        Self {
            op: ListOp::Clear,
            index: 0,
            item: None,
        }
    }
}

impl<E: Clone> ListChange<E> {
    /// Replays this record onto `target`.
    ///
    /// Returns `false` and leaves `target` untouched when the record does not
    /// fit (index out of bounds or missing item).
    pub fn apply(&self, target: &mut Vec<E>) -> bool {
        match (self.op, &self.item) {
            (ListOp::Add, Some(item)) if self.index <= target.len() => {
                target.insert(self.index, item.clone());
                true
            }
            (ListOp::Remove, _) if self.index < target.len() => {
                target.remove(self.index);
                true
            }
            (ListOp::Set, Some(item)) if self.index < target.len() => {
                target[self.index] = item.clone();
                true
            }
            (ListOp::Clear, _) => {
                target.clear();
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// Map mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MapOp {
    /// Insert or replace `key` with `value`.
    Put,
    /// Remove `key`.
    Remove,
    /// Remove every entry.
    Clear,
}

/// One logged map mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapChange<K, V> {
    /// Mutation kind.
    pub op: MapOp,
    /// Affected key, `None` for `CLEAR`.
    pub key: Option<K>,
    /// New value for `PUT`, `None` otherwise.
    pub value: Option<V>,
}

impl<K, V> MapChange<K, V> {
    /// `PUT key = value`.
    pub fn put(key: K, value: V) -> Self {
        Self {
            op: MapOp::Put,
            key: Some(key),
            value: Some(value),
        }
    }

    /// `REMOVE key`.
    pub fn remove(key: K) -> Self {
        Self {
            op: MapOp::Remove,
            key: Some(key),
            value: None,
        }
    }

    /// `CLEAR`.
    pub fn clear() -> Self {
        Self {
            op: MapOp::Clear,
            key: None,
            value: None,
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> MapChange<K, V> {
    /// Replays this record onto `target`. Returns `false` for a malformed
    /// record.
    pub fn apply<S: std::hash::BuildHasher>(&self, target: &mut HashMap<K, V, S>) -> bool {
        match (self.op, &self.key, &self.value) {
            (MapOp::Put, Some(key), Some(value)) => {
                target.insert(key.clone(), value.clone());
                true
            }
            (MapOp::Remove, Some(key), _) => {
                target.remove(key);
                true
            }
            (MapOp::Clear, _, _) => {
                target.clear();
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Set
// ---------------------------------------------------------------------------

/// Set mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SetOp {
    /// `item` was inserted.
    Add,
    /// `item` was removed.
    Remove,
    /// Every element was removed.
    Clear,
}

/// One logged set mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChange<E> {
    /// Mutation kind.
    pub op: SetOp,
    /// Affected element, `None` for `CLEAR`.
    pub item: Option<E>,
}

impl<E> SetChange<E> {
    /// `ADD item`.
    pub fn add(item: E) -> Self {
        Self {
            op: SetOp::Add,
            item: Some(item),
        }
    }

    /// `REMOVE item`.
    pub fn remove(item: E) -> Self {
        Self {
            op: SetOp::Remove,
            item: Some(item),
        }
    }

    /// `CLEAR`.
    pub fn clear() -> Self {
        Self {
            op: SetOp::Clear,
            item: None,
        }
    }
}

impl<E: Eq + Hash + Clone> SetChange<E> {
    /// Replays this record onto `target`. Returns `false` for a malformed
    /// record.
    pub fn apply<S: std::hash::BuildHasher>(&self, target: &mut HashSet<E, S>) -> bool {
        match (self.op, &self.item) {
            (SetOp::Add, Some(item)) => {
                target.insert(item.clone());
                true
            }
            (SetOp::Remove, Some(item)) => {
                target.remove(item);
                true
            }
            (SetOp::Clear, _) => {
                target.clear();
                true
            }
            _ => false,
        }
    }
}
