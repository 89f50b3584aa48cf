//! Demo state tree served by the binary.
//!
//! ```text
//! page
//! ├── counter          Observable<i64>
//! ├── todos            TrackedList<String>
//! ├── form             ContactForm (deep-writable: name, email, address.city, address.zip)
//! └── clock
//!     └── ticks        Observable<u64>, advanced by the tick task
//! ```

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use rivulet_core::binding::{
    Binding, BindingRegistry, FieldTable, Navigable, OwnerTree, RegistryError,
};
use rivulet_core::collections::TrackedList;
use rivulet_core::observable::Observable;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub zip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    pub address: Address,
}

impl Navigable for Address {
    fn members() -> &'static FieldTable<Self> {
        static TABLE: LazyLock<FieldTable<Address>> = LazyLock::new(|| {
            FieldTable::<Address>::new()
                .field("city", |a| &mut a.city)
                .field("zip", |a| &mut a.zip)
        });
        &TABLE
    }
}

impl Navigable for ContactForm {
    fn members() -> &'static FieldTable<Self> {
        static TABLE: LazyLock<FieldTable<ContactForm>> = LazyLock::new(|| {
            FieldTable::<ContactForm>::new()
                .field("name", |f| &mut f.name)
                .field("email", |f| &mut f.email)
                .nested("address", |f| &mut f.address)
        });
        &TABLE
    }
}

/// Variables shared by every scope the server hosts.
#[derive(Debug, Clone)]
pub struct DemoState {
    pub counter: Observable<i64>,
    pub ticks: Observable<u64>,
    pub todos: Observable<TrackedList<String>>,
    pub form: Observable<ContactForm>,
}

impl Default for DemoState {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoState {
    pub fn new() -> Self {
        Self {
            counter: Observable::new(0),
            ticks: Observable::new(0),
            todos: Observable::new(TrackedList::from(vec!["try `poll home 0`".to_string()])),
            form: Observable::new(ContactForm::default()),
        }
    }

    pub fn tree(&self) -> OwnerTree {
        OwnerTree::new("page")
            .bind("counter", Binding::value(self.counter.clone()))
            .bind("todos", Binding::tracked(self.todos.clone()))
            .bind("form", Binding::structured(self.form.clone()))
            .child(OwnerTree::new("clock").bind("ticks", Binding::value(self.ticks.clone())))
    }

    pub fn registry(&self) -> Result<BindingRegistry, RegistryError> {
        BindingRegistry::from_tree(&self.tree())
    }

    /// Advances the clock by one tick.
    pub fn tick(&self) {
        self.ticks.update(|t| *t += 1);
    }
}
