//! # Bindings
//!
//! A [`Binding`] type-erases one [`Observable`] so the sync engine can treat
//! every bound variable uniformly: take a JSON snapshot, assign a JSON value,
//! watch for changes and, for tracked collections, watch the delta stream.
//!
//! The [`BindingRegistry`] flattens a tree of owner nodes into one namespaced
//! `key -> Binding` map and routes inbound writes, including guarded deep
//! writes into structured values (see [`access`]).
//!
//! ## Binding kinds
//!
//! | Constructor             | Value type                      | Deltas | Deep writes |
//! |-------------------------|---------------------------------|--------|-------------|
//! | [`Binding::value`]      | any serde type                  | no     | no          |
//! | [`Binding::tracked`]    | `TrackedList`/`Map`/`Set`       | yes    | no          |
//! | [`Binding::structured`] | a [`Navigable`] struct          | no     | yes         |

pub mod access;
mod registry;

use std::fmt;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collections::{CollectionKind, DeltaSource};
use crate::observable::{Observable, Subscription};
use crate::protocol::{BoxError, CodecError, DeltaPacket};

pub use access::{is_forbidden_member, DeepWrite, FieldTable, Navigable};
pub use registry::{
    BindingRegistry, OwnerNode, OwnerTree, RegistryBuilder, RegistryError, WriteOutcome,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure to apply an inbound write.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Neither the key nor any of its prefixes is registered.
    #[error("no binding for key '{0}'")]
    UnknownKey(String),

    /// A deep write addressed no member.
    #[error("empty member path")]
    EmptyPath,

    /// The member name is never writable.
    #[error("member '{0}' is not writable")]
    Forbidden(String),

    /// The member is not in the type's accessor table.
    #[error("unknown member '{0}'")]
    UnknownMember(String),

    /// The path continues past a leaf field.
    #[error("member '{0}' has no members")]
    NotNavigable(String),

    /// The path stops at a structured member instead of one of its fields.
    #[error("member '{0}' is structured, write one of its fields")]
    Structured(String),

    /// The binding does not accept deep writes.
    #[error("binding '{0}' does not accept deep writes")]
    NotStructured(String),

    /// The value does not convert to the member's type.
    #[error("cannot convert value for '{member}': {source}")]
    Convert {
        /// Key or member the value was meant for.
        member: String,
        /// Conversion error.
        #[source]
        source: serde_json::Error,
    },

    /// The incoming message could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Callback run after an inbound write changed state, typically to store the
/// registry's values somewhere durable.
pub type PersistHook = Arc<dyn Fn(&BindingRegistry) -> Result<(), BoxError> + Send + Sync>;

/// Runs the hook, if any. Failures are logged and swallowed.
pub(crate) fn run_persist(hook: Option<&PersistHook>, registry: &BindingRegistry, key: &str) {
    if let Some(hook) = hook {
        if let Err(e) = hook(registry) {
            tracing::warn!(key, "persistence hook failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// SyncVar
// ---------------------------------------------------------------------------

pub(crate) type SnapshotListener = Arc<dyn Fn(Result<Value, CodecError>) + Send + Sync>;
pub(crate) type DeltaHandler = Arc<dyn Fn(DeltaPacket) + Send + Sync>;

type DeltaForwarder<T> = fn(&T, DeltaHandler) -> Subscription;
type DeepWriter<T> = fn(&mut T, &[&str], &Value) -> Result<bool, WriteError>;

/// Object-safe view of one bound variable.
pub(crate) trait SyncVar: Send + Sync {
    fn snapshot(&self) -> Result<Value, CodecError>;

    fn assign(&self, key: &str, value: &Value) -> Result<(), WriteError>;

    /// Listener receives the encoded value stored by each notifying `set`.
    fn watch(&self, listener: SnapshotListener) -> Subscription;

    /// Subscribes to the delta stream of the collection currently held, if
    /// any.
    fn watch_delta(&self, handler: DeltaHandler) -> Option<Subscription>;

    fn kind(&self) -> Option<CollectionKind>;

    fn deep_write(&self, key: &str, path: &[&str], value: &Value) -> Result<bool, WriteError>;

    fn clear_listeners(&self);

    fn set_active_guard(&self, guard: Arc<dyn Fn() -> bool + Send + Sync>);

    fn identity(&self) -> usize;
}

struct VarAdapter<T> {
    cell: Observable<T>,
    kind: Option<CollectionKind>,
    deltas: Option<DeltaForwarder<T>>,
    deep: Option<DeepWriter<T>>,
}

impl<T> SyncVar for VarAdapter<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn snapshot(&self) -> Result<Value, CodecError> {
        Ok(self.cell.with(|value| serde_json::to_value(value))?)
    }

    fn assign(&self, key: &str, value: &Value) -> Result<(), WriteError> {
        let converted = T::deserialize(value).map_err(|source| WriteError::Convert {
            member: key.to_string(),
            source,
        })?;
        self.cell.set(converted);
        Ok(())
    }

    fn watch(&self, listener: SnapshotListener) -> Subscription {
        self.cell
            .on_change(move |value| listener(serde_json::to_value(value).map_err(CodecError::from)))
    }

    fn watch_delta(&self, handler: DeltaHandler) -> Option<Subscription> {
        let forward = self.deltas?;
        Some(self.cell.with(|current| forward(current, handler)))
    }

    fn kind(&self) -> Option<CollectionKind> {
        self.kind
    }

    fn deep_write(&self, key: &str, path: &[&str], value: &Value) -> Result<bool, WriteError> {
        let Some(write) = self.deep else {
            return Err(WriteError::NotStructured(key.to_string()));
        };
        self.cell.try_update(|target| write(target, path, value))
    }

    fn clear_listeners(&self) {
        self.cell.clear_listeners();
    }

    fn set_active_guard(&self, guard: Arc<dyn Fn() -> bool + Send + Sync>) {
        self.cell.set_active_guard(move || guard());
    }

    fn identity(&self) -> usize {
        self.cell.identity()
    }
}

fn forward_deltas<C: DeltaSource>(collection: &C, handler: DeltaHandler) -> Subscription {
    collection.forward_records(Arc::new(move |records: &[C::Record]| {
        match DeltaPacket::from_records(C::KIND, records) {
            Ok(packet) => handler(packet),
            Err(e) => tracing::error!("failed to encode {} changes: {e}", C::KIND),
        }
    }))
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Type-erased handle to one bound [`Observable`].
///
/// Cloning is cheap and shares the variable.
#[derive(Clone)]
pub struct Binding {
    var: Arc<dyn SyncVar>,
}

impl Binding {
    /// Binds a plain value; changes are always sent as snapshots.
    #[must_use]
    pub fn value<T>(cell: Observable<T>) -> Self
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Self::from_adapter(VarAdapter {
            cell,
            kind: None,
            deltas: None,
            deep: None,
        })
    }

    /// Binds a variable holding a tracked collection; in-place mutations are
    /// sent as deltas, replacing the collection sends a snapshot.
    #[must_use]
    pub fn tracked<C>(cell: Observable<C>) -> Self
    where
        C: DeltaSource + Serialize + DeserializeOwned,
    {
        Self::from_adapter(VarAdapter {
            cell,
            kind: Some(C::KIND),
            deltas: Some(forward_deltas::<C>),
            deep: None,
        })
    }

    /// Binds a structured value that accepts deep writes through its
    /// [`FieldTable`].
    #[must_use]
    pub fn structured<T>(cell: Observable<T>) -> Self
    where
        T: DeepWrite + Serialize + DeserializeOwned + Clone,
    {
        Self::from_adapter(VarAdapter {
            cell,
            kind: None,
            deltas: None,
            deep: Some(<T as DeepWrite>::write_path),
        })
    }

    fn from_adapter<T>(adapter: VarAdapter<T>) -> Self
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Self {
            var: Arc::new(adapter),
        }
    }

    /// Encodes the current value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Value`] if the value is not serializable.
    pub fn snapshot(&self) -> Result<Value, CodecError> {
        self.var.snapshot()
    }

    /// Collection kind for tracked bindings.
    #[must_use]
    pub fn kind(&self) -> Option<CollectionKind> {
        self.var.kind()
    }

    /// Drops every change listener of the underlying variable, as when its
    /// owner unmounts.
    pub fn clear_listeners(&self) {
        self.var.clear_listeners();
    }

    /// Installs an activity guard on the underlying variable.
    pub fn set_active_guard(&self, guard: impl Fn() -> bool + Send + Sync + 'static) {
        self.var.set_active_guard(Arc::new(guard));
    }

    /// Returns `true` if both bindings wrap the same variable.
    #[must_use]
    pub fn same_variable(&self, other: &Self) -> bool {
        self.var.identity() == other.var.identity()
    }

    /// Weak handle that does not keep the variable alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakBinding {
        WeakBinding {
            var: Arc::downgrade(&self.var),
        }
    }

    pub(crate) fn identity(&self) -> usize {
        self.var.identity()
    }

    pub(crate) fn assign(&self, key: &str, value: &Value) -> Result<(), WriteError> {
        self.var.assign(key, value)
    }

    pub(crate) fn deep_write(
        &self,
        key: &str,
        path: &[&str],
        value: &Value,
    ) -> Result<bool, WriteError> {
        self.var.deep_write(key, path, value)
    }

    pub(crate) fn watch(&self, listener: SnapshotListener) -> Subscription {
        self.var.watch(listener)
    }

    pub(crate) fn watch_delta(&self, handler: DeltaHandler) -> Option<Subscription> {
        self.var.watch_delta(handler)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind())
            .field("identity", &self.identity())
            .finish()
    }
}

/// Non-owning [`Binding`] handle.
#[derive(Clone)]
pub struct WeakBinding {
    var: Weak<dyn SyncVar>,
}

impl WeakBinding {
    /// Returns the binding if the variable is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Binding> {
        self.var.upgrade().map(|var| Binding { var })
    }
}

impl fmt::Debug for WeakBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBinding")
            .field("alive", &(self.var.strong_count() > 0))
            .finish()
    }
}
