//! # Cell Store
//!
//! An in-process, reactive, schema-optional tabular data store: nested
//! `Tables` → `Rows` → `Cells` plus a flat `Values` map, with fine-grained
//! change listeners, atomic transactions and a rollback hook.
//!
//! ## Core Concepts
//!
//! - **Cells**: scalar data at `(table, row, cell)` coordinates
//! - **Values**: a flat keyed scalar map alongside the tables
//! - **Listeners**: wildcard path subscriptions notified once per settled
//!   net change; mutator listeners may rewrite data before others see it
//! - **Transactions**: batched mutations with net-diff collapse and opt-in
//!   rollback
//! - **Schema**: optional per-cell type and default declarations
//!
//! ## Example
//!
//! ```
//! use cellstore::{Cell, Store};
//!
//! let store = Store::new();
//! store.add_cell_listener(Some("pets"), None, Some("legs"), false,
//!     |_, _, row, _, new, _| {
//!         println!("{row} now has {:?} legs", new.and_then(Cell::as_number));
//!     });
//!
//! store.transaction(|store| {
//!     store.set_cell("pets", "fido", "legs", 4);
//!     store.set_cell("pets", "fido", "sound", "woof");
//! });
//! ```

pub mod derived;
pub mod error;
pub mod listeners;
pub mod persister;
pub mod schema;
pub mod store;
pub mod transactions;
pub mod types;

// Re-exports
pub use derived::DerivedComponent;
pub use error::{Result, StoreError};
pub use listeners::{ListenerId, ListenerKind, ListenerStats};
pub use persister::{FileMedium, Persister, PersisterMedium, PersisterStats};
pub use schema::{CellSchema, TablesSchema, ValueSchema, ValuesSchema};
pub use store::Store;
pub use transactions::{ChangedCells, ChangedValues, InvalidCells, InvalidValues};
pub use types::{Cell, CellKind, Id, Row, Table, Tables, Value, Values};
