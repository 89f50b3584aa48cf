//! Binding registry.
//!
//! Flattens an owner-node tree into one namespaced map:
//!
//! ```text
//! page                     count        -> Binding
//! ├── clock                clock.now    -> Binding
//! └── form                 form.model   -> Binding
//!     └── address          form.address.city -> Binding
//! ```
//!
//! Root bindings keep their local names; each child's keys are merged under
//! `<child-id>.`, recursively. Assembly fails fast on a reused child id, a
//! key collision, or a variable registered under two keys. Ownership is kept
//! as an indexed owner id per key, never as a back-pointer.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use serde_json::Value;

use super::{Binding, WriteError};

/// Registry assembly errors. These are programming errors in the owner tree
/// and are reported synchronously at assembly time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two children of the same owner share an id.
    #[error("duplicate child id '{alias}' under owner '{parent}'")]
    DuplicateAlias {
        /// Owner whose children collide.
        parent: String,
        /// Reused child id.
        alias: String,
    },

    /// Two bindings flatten to the same key.
    #[error("duplicate binding key '{0}'")]
    DuplicateKey(String),

    /// One variable is registered under two keys.
    #[error("variable already registered as '{existing}', cannot register as '{key}'")]
    DuplicateVariable {
        /// Key of the first registration.
        existing: String,
        /// Key of the rejected registration.
        key: String,
    },
}

/// Result of a successful inbound write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A registered variable was assigned directly.
    Assigned,
    /// A deep write changed a member of a structured variable.
    Updated,
    /// A deep write found the member already holding the value; nothing was
    /// notified.
    Unchanged,
}

impl WriteOutcome {
    /// Returns `true` unless the write was suppressed as a no-op.
    #[must_use]
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

// ---------------------------------------------------------------------------
// Owner nodes
// ---------------------------------------------------------------------------

/// A node of the owner tree, as consumed by the registry.
pub trait OwnerNode {
    /// Instance id; used as the key prefix of this node's bindings when it
    /// is a child.
    fn id(&self) -> &str;

    /// Bindings declared directly on this node, by local name.
    fn own_bindings(&self) -> Vec<(String, Binding)>;

    /// Child nodes.
    fn children(&self) -> Vec<&dyn OwnerNode>;
}

/// Plain owner tree, built explicitly.
#[derive(Debug, Clone)]
pub struct OwnerTree {
    id: String,
    bindings: Vec<(String, Binding)>,
    children: Vec<OwnerTree>,
}

impl OwnerTree {
    /// Creates a node with no bindings and no children.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bindings: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Adds a binding under a local name.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.push((name.into(), binding));
        self
    }

    /// Adds a child node.
    #[must_use]
    pub fn child(mut self, child: OwnerTree) -> Self {
        self.children.push(child);
        self
    }
}

impl OwnerNode for OwnerTree {
    fn id(&self) -> &str {
        &self.id
    }

    fn own_bindings(&self) -> Vec<(String, Binding)> {
        self.bindings.clone()
    }

    fn children(&self) -> Vec<&dyn OwnerNode> {
        self.children.iter().map(|c| c as &dyn OwnerNode).collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RegistryEntry {
    binding: Binding,
    owner: Arc<str>,
}

/// Flat, immutable `key -> Binding` map with owner ids.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl BindingRegistry {
    /// Flattens `root` and every descendant.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] on a reused child id, a key collision or a
    /// variable registered twice.
    pub fn from_tree(root: &dyn OwnerNode) -> Result<Self, RegistryError> {
        let mut builder = RegistryBuilder::new();
        builder.mount(root)?;
        Ok(builder.build())
    }

    /// Starts an incremental assembly.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Looks up a registered key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Binding> {
        self.entries.get(key).map(|e| &e.binding)
    }

    /// Owner id of a registered key.
    #[must_use]
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| &*e.owner)
    }

    /// Iterates `(key, binding)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.binding))
    }

    /// Registered keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a dotted path to the nearest registered ancestor and the
    /// member path below it.
    ///
    /// The longest registered prefix wins. If none matches, a key whose last
    /// segment equals the path's first segment is used, so clients may
    /// address a variable by its local name.
    #[must_use]
    pub fn resolve_deep<'p>(&self, path: &'p str) -> Option<(&str, &Binding, Vec<&'p str>)> {
        let parts: Vec<&str> = path.split('.').collect();
        for split in (1..parts.len()).rev() {
            let prefix = parts[..split].join(".");
            if let Some((key, entry)) = self.entries.get_key_value(&prefix) {
                return Some((key, &entry.binding, parts[split..].to_vec()));
            }
        }
        if parts.len() < 2 {
            return None;
        }
        let suffix = format!(".{}", parts[0]);
        self.entries
            .iter()
            .find(|(key, _)| key.ends_with(&suffix))
            .map(|(key, entry)| (key.as_str(), &entry.binding, parts[1..].to_vec()))
    }

    /// Applies an inbound write.
    ///
    /// A registered key is assigned directly. Otherwise a dotted key is
    /// routed to the nearest registered structured ancestor, whose member is
    /// converted, compared and written only if it differs.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::UnknownKey`] if nothing matches, or the
    /// conversion/navigation error of the attempted write.
    pub fn write(&self, key: &str, value: &Value) -> Result<WriteOutcome, WriteError> {
        if let Some(binding) = self.get(key) {
            binding.assign(key, value)?;
            return Ok(WriteOutcome::Assigned);
        }
        if !key.contains('.') {
            return Err(WriteError::UnknownKey(key.to_string()));
        }
        let (root, binding, path) = self
            .resolve_deep(key)
            .ok_or_else(|| WriteError::UnknownKey(key.to_string()))?;
        if binding.deep_write(root, &path, value)? {
            Ok(WriteOutcome::Updated)
        } else {
            Ok(WriteOutcome::Unchanged)
        }
    }

    /// Drops every change listener of every registered variable, as when the
    /// whole tree unmounts.
    pub fn clear_listeners(&self) {
        for entry in self.entries.values() {
            entry.binding.clear_listeners();
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incremental registry assembly.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, RegistryEntry>,
    variables: FxHashMap<usize, String>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one binding under a fully qualified key.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateKey`] or
    /// [`RegistryError::DuplicateVariable`].
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        owner: &str,
        binding: Binding,
    ) -> Result<&mut Self, RegistryError> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        if let Some(existing) = self.variables.get(&binding.identity()) {
            return Err(RegistryError::DuplicateVariable {
                existing: existing.clone(),
                key,
            });
        }
        self.variables.insert(binding.identity(), key.clone());
        self.entries.insert(
            key,
            RegistryEntry {
                binding,
                owner: Arc::from(owner),
            },
        );
        Ok(self)
    }

    /// Flattens `root` into the builder with bare root keys.
    ///
    /// # Errors
    ///
    /// See [`BindingRegistry::from_tree`].
    pub fn mount(&mut self, root: &dyn OwnerNode) -> Result<&mut Self, RegistryError> {
        self.collect(root, "")?;
        Ok(self)
    }

    /// Flattens `node` with every key under `prefix.`.
    ///
    /// # Errors
    ///
    /// See [`BindingRegistry::from_tree`].
    pub fn mount_at(&mut self, prefix: &str, node: &dyn OwnerNode) -> Result<&mut Self, RegistryError> {
        self.collect(node, prefix)?;
        Ok(self)
    }

    fn collect(&mut self, node: &dyn OwnerNode, prefix: &str) -> Result<(), RegistryError> {
        for (name, binding) in node.own_bindings() {
            self.insert(qualify(prefix, &name), node.id(), binding)?;
        }
        let mut seen = FxHashSet::default();
        for child in node.children() {
            if !seen.insert(child.id().to_string()) {
                return Err(RegistryError::DuplicateAlias {
                    parent: node.id().to_string(),
                    alias: child.id().to_string(),
                });
            }
            self.collect(child, &qualify(prefix, child.id()))?;
        }
        Ok(())
    }

    /// Finishes assembly.
    #[must_use]
    pub fn build(self) -> BindingRegistry {
        BindingRegistry {
            entries: self.entries,
        }
    }
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
