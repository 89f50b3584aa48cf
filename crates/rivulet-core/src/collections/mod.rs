//! # Delta-Tracking Collections
//!
//! List, map and set containers that perform the ordinary mutation **and**
//! append one change record per primitive mutation, in the same critical
//! section. The pending log can be drained atomically, and delta listeners
//! receive the records of every mutation as it happens.
//!
//! ## Record semantics
//!
//! | Operation                  | Records                                 |
//! |----------------------------|-----------------------------------------|
//! | `list.push(e)`             | `ADD` at previous length                |
//! | `list.insert(i, e)`        | `ADD` at `i`                            |
//! | `list.remove(i)`           | `REMOVE` at `i`                         |
//! | `list.remove_item(&e)`     | `REMOVE` at the resolved index          |
//! | `list.set(i, e)`           | `SET` at `i`                            |
//! | `list.remove_if(p)`        | one `REMOVE` per match, tail to head    |
//! | `map.put(k, v)`            | `PUT`                                   |
//! | `map.remove(&k)`           | `REMOVE` if `k` was present             |
//! | `set.insert(e)`            | `ADD` if newly inserted                 |
//! | `set.remove(&e)`           | `REMOVE` if present                     |
//! | `clear()` (all kinds)      | one `CLEAR` if non-empty, else nothing  |
//!
//! Bulk operations (`extend`, `put_all`, `remove_all`, `retain_all`) log one
//! primitive record per element; there is no bulk record.
//!
//! `CLEAR` is appended after the container has been emptied, inside the same
//! critical section, for all three kinds. Because the log and the container
//! are only observable under that lock, no reader can tell the two orders
//! apart.

mod change;
mod list;
mod map;
mod set;
mod tracked;

use std::sync::Arc;

use serde::Serialize;

use crate::observable::Subscription;

pub use change::{
    CollectionKind, ListChange, ListOp, MapChange, MapOp, SetChange, SetOp,
};
pub use list::TrackedList;
pub use map::TrackedMap;
pub use set::TrackedSet;

/// A tracked container as seen by the sync engine.
///
/// Implemented by [`TrackedList`], [`TrackedMap`] and [`TrackedSet`]; a
/// [`Binding`](crate::Binding) over an observable holding one of these
/// forwards the container's records as delta packets.
pub trait DeltaSource: Clone + Send + Sync + 'static {
    /// Record type logged by the container.
    type Record: Serialize + Clone + Send + Sync + 'static;

    /// Wire kind of the container.
    const KIND: CollectionKind;

    /// Registers a listener that receives the records of every mutation and
    /// consumes the pending log once the listener returns.
    fn forward_records(
        &self,
        listener: Arc<dyn Fn(&[Self::Record]) + Send + Sync>,
    ) -> Subscription;

    /// Identity of the underlying instance; equal for handles to the same
    /// container.
    fn instance_id(&self) -> usize;
}
