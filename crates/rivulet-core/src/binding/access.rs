//! Typed accessor tables for guarded deep-path writes.
//!
//! A structured value opts into deep writes by implementing [`Navigable`]
//! and listing its writable members in a [`FieldTable`]. Members that are
//! not in the table cannot be reached, and names that denote type metadata
//! or serialization internals are rejected before any lookup.
//!
//! ```rust
//! use std::sync::LazyLock;
//! use rivulet_core::binding::{FieldTable, Navigable};
//!
//! struct Address { city: String }
//!
//! struct Form { name: String, address: Address }
//!
//! impl Navigable for Address {
//!     fn members() -> &'static FieldTable<Self> {
//!         static TABLE: LazyLock<FieldTable<Address>> =
//!             LazyLock::new(|| FieldTable::<Address>::new().field("city", |a| &mut a.city));
//!         &TABLE
//!     }
//! }
//!
//! impl Navigable for Form {
//!     fn members() -> &'static FieldTable<Self> {
//!         static TABLE: LazyLock<FieldTable<Form>> = LazyLock::new(|| {
//!             FieldTable::<Form>::new()
//!                 .field("name", |f| &mut f.name)
//!                 .nested("address", |f| &mut f.address)
//!         });
//!         &TABLE
//!     }
//! }
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::WriteError;

/// Returns `true` for member names that are never writable: type metadata,
/// loader handles, serialization versions and synthetic outer references.
#[must_use]
pub fn is_forbidden_member(name: &str) -> bool {
    matches!(
        name,
        "class" | "classLoader" | "serialVersionUID" | "constructor" | "prototype"
    ) || name.starts_with("this$")
        || name.starts_with("__")
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Capability to apply a write addressed by a member path.
pub trait DeepWrite: Send + Sync + 'static {
    /// Writes `value` at `path` (relative to `self`).
    ///
    /// Returns `Ok(true)` if the target changed and `Ok(false)` if it already
    /// held an equal value.
    ///
    /// # Errors
    ///
    /// Returns a [`WriteError`] when the path is empty, forbidden, unknown,
    /// or the value does not convert to the member's type. `self` is left
    /// untouched on error.
    fn write_path(&mut self, path: &[&str], value: &Value) -> Result<bool, WriteError>;
}

/// A type with a static table of writable members.
pub trait Navigable: Sized + Send + Sync + 'static {
    /// The member table; usually a `static LazyLock<FieldTable<Self>>`.
    fn members() -> &'static FieldTable<Self>;
}

impl<T: Navigable> DeepWrite for T {
    fn write_path(&mut self, path: &[&str], value: &Value) -> Result<bool, WriteError> {
        T::members().write(self, path, value)
    }
}

// ---------------------------------------------------------------------------
// FieldTable
// ---------------------------------------------------------------------------

trait Assign<T>: Send + Sync {
    fn assign(&self, target: &mut T, name: &str, value: &Value) -> Result<bool, WriteError>;
}

trait Navigate<T>: Send + Sync {
    fn navigate(&self, target: &mut T, path: &[&str], value: &Value) -> Result<bool, WriteError>;
}

struct FieldAccess<T, F> {
    get: fn(&mut T) -> &mut F,
}

impl<T, F> Assign<T> for FieldAccess<T, F>
where
    F: DeserializeOwned + PartialEq,
{
    fn assign(&self, target: &mut T, name: &str, value: &Value) -> Result<bool, WriteError> {
        let converted = F::deserialize(value).map_err(|source| WriteError::Convert {
            member: name.to_string(),
            source,
        })?;
        let slot = (self.get)(target);
        if *slot == converted {
            return Ok(false);
        }
        *slot = converted;
        Ok(true)
    }
}

struct NestedAccess<T, N> {
    get: fn(&mut T) -> &mut N,
}

impl<T, N: DeepWrite> Navigate<T> for NestedAccess<T, N> {
    fn navigate(&self, target: &mut T, path: &[&str], value: &Value) -> Result<bool, WriteError> {
        (self.get)(target).write_path(path, value)
    }
}

enum Member<T> {
    Field(Box<dyn Assign<T>>),
    Nested(Box<dyn Navigate<T>>),
}

/// Table of writable members of `T`, keyed by wire name.
///
/// Leaf fields are converted from JSON to the field's type and compared
/// with the current value before being written; nested members delegate the
/// rest of the path to the nested type's own table.
pub struct FieldTable<T> {
    members: Vec<(&'static str, Member<T>)>,
}

impl<T: 'static> FieldTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Adds a leaf field.
    #[must_use]
    pub fn field<F>(mut self, name: &'static str, get: fn(&mut T) -> &mut F) -> Self
    where
        F: DeserializeOwned + PartialEq + 'static,
    {
        self.members
            .push((name, Member::Field(Box::new(FieldAccess { get }))));
        self
    }

    /// Adds a member whose own members are reachable through a longer path.
    #[must_use]
    pub fn nested<N: DeepWrite>(mut self, name: &'static str, get: fn(&mut T) -> &mut N) -> Self {
        self.members
            .push((name, Member::Nested(Box::new(NestedAccess { get }))));
        self
    }

    /// Names of every member, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.members.iter().map(|(name, _)| *name)
    }

    /// Applies `value` at `path` inside `target`.
    ///
    /// # Errors
    ///
    /// See [`DeepWrite::write_path`].
    pub fn write(&self, target: &mut T, path: &[&str], value: &Value) -> Result<bool, WriteError> {
        let Some((head, rest)) = path.split_first() else {
            return Err(WriteError::EmptyPath);
        };
        if is_forbidden_member(head) {
            return Err(WriteError::Forbidden((*head).to_string()));
        }
        let member = self
            .members
            .iter()
            .find(|(name, _)| name == head)
            .map(|(_, member)| member)
            .ok_or_else(|| WriteError::UnknownMember((*head).to_string()))?;

        match (member, rest.is_empty()) {
            (Member::Field(field), true) => field.assign(target, head, value),
            (Member::Field(_), false) => Err(WriteError::NotNavigable((*head).to_string())),
            (Member::Nested(nested), false) => nested.navigate(target, rest, value),
            (Member::Nested(_), true) => Err(WriteError::Structured((*head).to_string())),
        }
    }
}

impl<T: 'static> Default for FieldTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FieldTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.members.iter().map(|(name, _)| name))
            .finish()
    }
}
