//! Subscription bookkeeping shared by the broadcast core and the replay hub.
//!
//! [`RegistryWatch`] subscribes to every binding of a registry and forwards
//! snapshots and delta packets to a [`ChangeHandler`]. For bindings holding a
//! tracked collection it also keeps one delta subscription per key, torn
//! down and re-established every time the variable's stored collection
//! changes, so a replaced collection is no longer observed.
//!
//! Listeners capture the handler and the bindings weakly: dropping the
//! owner of the watch releases everything even if `release` is never called.

use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::binding::{Binding, BindingRegistry};
use crate::observable::Subscription;
use crate::protocol::{CodecError, DeltaPacket};

/// Receiver of change notifications from a [`RegistryWatch`].
pub(crate) trait ChangeHandler: Send + Sync + 'static {
    /// A variable stored a new value.
    fn on_snapshot(&self, key: &str, value: Result<Value, CodecError>);

    /// A tracked collection logged changes.
    fn on_delta(&self, key: &str, packet: DeltaPacket);
}

type DeltaSubs = Mutex<FxHashMap<Arc<str>, Subscription>>;

pub(crate) struct RegistryWatch {
    changes: Mutex<Vec<Subscription>>,
    deltas: Arc<DeltaSubs>,
}

impl RegistryWatch {
    pub(crate) fn attach<H: ChangeHandler>(registry: &BindingRegistry, handler: &Weak<H>) -> Self {
        let deltas: Arc<DeltaSubs> = Arc::new(Mutex::new(FxHashMap::default()));
        let mut changes = Vec::with_capacity(registry.len());

        for (key, binding) in registry.iter() {
            let key: Arc<str> = Arc::from(key);
            if binding.kind().is_some() {
                resubscribe(&deltas, &key, binding, handler);
            }

            let weak_binding = binding.downgrade();
            let weak_deltas = Arc::downgrade(&deltas);
            let handler = handler.clone();
            changes.push(binding.watch(Arc::new(move |value: Result<Value, CodecError>| {
                if let (Some(binding), Some(deltas)) = (weak_binding.upgrade(), weak_deltas.upgrade())
                {
                    if binding.kind().is_some() {
                        resubscribe(&deltas, &key, &binding, &handler);
                    }
                }
                if let Some(handler) = handler.upgrade() {
                    handler.on_snapshot(&key, value);
                }
            })));
        }

        Self {
            changes: Mutex::new(changes),
            deltas,
        }
    }

    /// Number of live delta subscriptions.
    pub(crate) fn delta_count(&self) -> usize {
        self.deltas.lock().len()
    }

    /// Number of live change subscriptions.
    pub(crate) fn change_count(&self) -> usize {
        self.changes.lock().len()
    }

    /// Removes every listener this watch registered.
    pub(crate) fn release(&self) {
        let changes = std::mem::take(&mut *self.changes.lock());
        let deltas = std::mem::take(&mut *self.deltas.lock());
        drop(changes);
        drop(deltas);
    }
}

impl Drop for RegistryWatch {
    fn drop(&mut self) {
        self.release();
    }
}

/// Replaces the delta subscription of `key` with one on the collection the
/// binding holds now. Runs under the map lock so concurrent replacements
/// settle on the latest stored collection.
fn resubscribe<H: ChangeHandler>(
    deltas: &DeltaSubs,
    key: &Arc<str>,
    binding: &Binding,
    handler: &Weak<H>,
) {
    let stale = {
        let mut map = deltas.lock();
        let handler = handler.clone();
        let delta_key = Arc::clone(key);
        let fresh = binding.watch_delta(Arc::new(move |packet: DeltaPacket| {
            if let Some(handler) = handler.upgrade() {
                handler.on_delta(&delta_key, packet);
            }
        }));
        match fresh {
            Some(sub) => map.insert(Arc::clone(key), sub),
            None => map.remove(key),
        }
    };
    drop(stale);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::OwnerTree;
    use crate::collections::TrackedList;
    use crate::observable::Observable;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ChangeHandler for Recorder {
        fn on_snapshot(&self, key: &str, value: Result<Value, CodecError>) {
            self.events
                .lock()
                .push(format!("snap {key} {}", value.unwrap()));
        }

        fn on_delta(&self, key: &str, packet: DeltaPacket) {
            self.events
                .lock()
                .push(format!("delta {key} {}", packet.changes.len()));
        }
    }

    #[test]
    fn test_forwards_snapshots_and_deltas() {
        let count = Observable::new(0);
        let list = TrackedList::new();
        let todos = Observable::new(list.clone());
        let tree = OwnerTree::new("page")
            .bind("count", Binding::value(count.clone()))
            .bind("todos", Binding::tracked(todos));
        let registry = BindingRegistry::from_tree(&tree).unwrap();

        let recorder = Arc::new(Recorder::default());
        let watch = RegistryWatch::attach(&registry, &Arc::downgrade(&recorder));
        assert_eq!(watch.change_count(), 2);
        assert_eq!(watch.delta_count(), 1);

        count.set(3);
        list.push("a".to_string());
        assert_eq!(
            *recorder.events.lock(),
            vec!["snap count 3".to_string(), "delta todos 1".to_string()]
        );
    }

    #[test]
    fn test_replaced_collection_is_no_longer_observed() {
        let old = TrackedList::new();
        let todos = Observable::new(old.clone());
        let tree = OwnerTree::new("page").bind("todos", Binding::tracked(todos.clone()));
        let registry = BindingRegistry::from_tree(&tree).unwrap();
        let recorder = Arc::new(Recorder::default());
        let _watch = RegistryWatch::attach(&registry, &Arc::downgrade(&recorder));

        let fresh = TrackedList::new();
        todos.set(fresh.clone());
        old.push(1);
        fresh.push(2);

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "snap todos []");
        assert_eq!(events[1], "delta todos 1");
        assert_eq!(old.listener_count(), 0);
    }

    #[test]
    fn test_release_removes_listeners() {
        let count = Observable::new(0);
        let list: TrackedList<u8> = TrackedList::new();
        let tree = OwnerTree::new("page")
            .bind("count", Binding::value(count.clone()))
            .bind("items", Binding::tracked(Observable::new(list.clone())));
        let registry = BindingRegistry::from_tree(&tree).unwrap();
        let recorder = Arc::new(Recorder::default());
        let watch = RegistryWatch::attach(&registry, &Arc::downgrade(&recorder));
        assert_eq!(count.listener_count(), 1);
        assert_eq!(list.listener_count(), 1);

        watch.release();
        assert_eq!(count.listener_count(), 0);
        assert_eq!(list.listener_count(), 0);
        assert_eq!(watch.delta_count(), 0);
    }
}
