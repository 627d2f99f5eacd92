//! The Store facade tying all components together.
//!
//! A `Store` is a cheap-to-clone handle to single-threaded, in-memory
//! tabular data (`Tables` → `Rows` → `Cells`, plus a flat `Values` map) with
//! fine-grained change listeners, atomic transactions and optional schema
//! enforcement. Every mutation runs inside a transaction — an implicit
//! one-shot transaction when called directly — and listeners are notified
//! exactly once per settled net change.

use crate::error::{Result, StoreError};
use crate::listeners::{Callback, ListenerId, ListenerKind, ListenerStats, Registry};
use crate::schema::{self, Checked, TablesSchema, ValuesSchema};
use crate::transactions::{
    ChangedCells, ChangedValues, FiredAt, InvalidCells, InvalidValues, Transaction,
};
use crate::types::{Cell, CellCoord, Id, Row, RowCoord, Table, Tables, Value, Values};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

/// Rollback predicate: receives the settled net diff and the invalid-write
/// logs; returning `true` reverts the transaction with zero notifications.
pub type RollbackFn<'a> =
    Box<dyn FnOnce(&ChangedCells, &InvalidCells, &ChangedValues, &InvalidValues) -> bool + 'a>;

/// A cell write: either a literal or a function of the live old value,
/// resolved at apply time.
enum CellUpdate<'a> {
    Set(Cell),
    Map(Box<dyn FnOnce(Option<&Cell>) -> Cell + 'a>),
}

impl<'a> CellUpdate<'a> {
    fn resolve(self, old: Option<&Cell>) -> Cell {
        match self {
            CellUpdate::Set(cell) => cell,
            CellUpdate::Map(f) => f(old),
        }
    }
}

struct Inner {
    store_id: u64,
    tables: Tables,
    values: Values,
    tables_schema: Option<TablesSchema>,
    values_schema: Option<ValuesSchema>,
    registry: Registry,
    tx: Option<Transaction>,
}

/// The reactive tabular store.
#[derive(Clone)]
pub struct Store {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// One planned listener invocation, with arguments captured at plan time.
enum Call {
    Tables,
    TableIds,
    Table(Id),
    RowIds(Id),
    Row(Id, Id),
    CellIds(Id, Id),
    Cell(Id, Id, Id, Option<Cell>, Option<Cell>),
    Values,
    ValueIds,
    Value(Id, Option<Value>, Option<Value>),
    InvalidCell(Id, Id, Id, Vec<Cell>),
    InvalidValue(Id, Vec<Value>),
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                store_id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                tables: Tables::new(),
                values: Values::new(),
                tables_schema: None,
                values_schema: None,
                registry: Registry::new(),
                tx: None,
            })),
        }
    }

    /// Stable identity of this store instance, used to key per-store
    /// singletons such as derived components.
    pub fn store_id(&self) -> u64 {
        self.inner.borrow().store_id
    }

    // --- Reads ---

    /// Clone of the whole table container.
    pub fn get_tables(&self) -> Tables {
        self.inner.borrow().tables.clone()
    }

    /// Clone of one table, if present.
    pub fn get_table(&self, table_id: &str) -> Option<Table> {
        self.inner.borrow().tables.get(table_id).cloned()
    }

    /// Clone of one row, if present.
    pub fn get_row(&self, table_id: &str, row_id: &str) -> Option<Row> {
        self.inner
            .borrow()
            .tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .cloned()
    }

    /// One cell, if present.
    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<Cell> {
        self.inner
            .borrow()
            .tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .and_then(|r| r.get(cell_id))
            .cloned()
    }

    /// Clone of the flat value container.
    pub fn get_values(&self) -> Values {
        self.inner.borrow().values.clone()
    }

    /// One value, if present.
    pub fn get_value(&self, value_id: &str) -> Option<Value> {
        self.inner.borrow().values.get(value_id).cloned()
    }

    /// Ids of all tables, sorted.
    pub fn get_table_ids(&self) -> Vec<Id> {
        self.inner.borrow().tables.keys().cloned().collect()
    }

    /// Ids of all rows in a table, sorted.
    pub fn get_row_ids(&self, table_id: &str) -> Vec<Id> {
        self.inner
            .borrow()
            .tables
            .get(table_id)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of all cells in a row, sorted.
    pub fn get_cell_ids(&self, table_id: &str, row_id: &str) -> Vec<Id> {
        self.inner
            .borrow()
            .tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of all values, sorted.
    pub fn get_value_ids(&self) -> Vec<Id> {
        self.inner.borrow().values.keys().cloned().collect()
    }

    pub fn has_tables(&self) -> bool {
        !self.inner.borrow().tables.is_empty()
    }

    pub fn has_table(&self, table_id: &str) -> bool {
        self.inner.borrow().tables.contains_key(table_id)
    }

    pub fn has_row(&self, table_id: &str, row_id: &str) -> bool {
        self.inner
            .borrow()
            .tables
            .get(table_id)
            .is_some_and(|t| t.contains_key(row_id))
    }

    pub fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.inner
            .borrow()
            .tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
            .is_some_and(|r| r.contains_key(cell_id))
    }

    pub fn has_values(&self) -> bool {
        !self.inner.borrow().values.is_empty()
    }

    pub fn has_value(&self, value_id: &str) -> bool {
        self.inner.borrow().values.contains_key(value_id)
    }

    /// Visit every table without cloning the container.
    ///
    /// The callback must not mutate the store; reads are fine.
    pub fn for_each_table(&self, mut f: impl FnMut(&str, &Table)) {
        for (table_id, table) in &self.inner.borrow().tables {
            f(table_id, table);
        }
    }

    /// Visit every row of a table without cloning.
    pub fn for_each_row(&self, table_id: &str, mut f: impl FnMut(&str, &Row)) {
        if let Some(table) = self.inner.borrow().tables.get(table_id) {
            for (row_id, row) in table {
                f(row_id, row);
            }
        }
    }

    /// Visit every cell of a row without cloning.
    pub fn for_each_cell(&self, table_id: &str, row_id: &str, mut f: impl FnMut(&str, &Cell)) {
        if let Some(row) = self
            .inner
            .borrow()
            .tables
            .get(table_id)
            .and_then(|t| t.get(row_id))
        {
            for (cell_id, cell) in row {
                f(cell_id, cell);
            }
        }
    }

    /// Visit every value without cloning.
    pub fn for_each_value(&self, mut f: impl FnMut(&str, &Value)) {
        for (value_id, value) in &self.inner.borrow().values {
            f(value_id, value);
        }
    }

    // --- JSON ---

    /// Serialize `[Tables, Values]` as a JSON string.
    pub fn get_json(&self) -> String {
        let inner = self.inner.borrow();
        serde_json::to_string(&(&inner.tables, &inner.values)).unwrap_or_else(|_| "[{},{}]".into())
    }

    /// Replace the whole store content from a `[Tables, Values]` JSON string.
    ///
    /// Malformed or structurally wrong JSON leaves the store exactly as it
    /// was; there is no partial application.
    pub fn set_json(&self, json: &str) -> Result<()> {
        let (tables, values): (Tables, Values) =
            serde_json::from_str(json).map_err(|e| StoreError::MalformedJson(e.to_string()))?;
        self.transaction(|store| {
            // Empty containers mean "delete everything", not "leave as is".
            match tables.is_empty() {
                true => store.del_tables(),
                false => store.set_tables(tables.clone()),
            };
            match values.is_empty() {
                true => store.del_values(),
                false => store.set_values(values.clone()),
            };
        });
        Ok(())
    }

    /// Serialize `[TablesSchema, ValuesSchema]` as a JSON string. Absent
    /// schemas serialize as `null`.
    pub fn get_schema_json(&self) -> String {
        let inner = self.inner.borrow();
        serde_json::to_string(&(&inner.tables_schema, &inner.values_schema))
            .unwrap_or_else(|_| "[null,null]".into())
    }

    // --- Writes ---

    /// Replace the whole table container. An empty payload is a no-op.
    pub fn set_tables(&self, tables: Tables) -> &Self {
        if tables.is_empty() {
            return self;
        }
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                let existing: Vec<Id> = inner.tables.keys().cloned().collect();
                for table_id in existing {
                    if !tables.contains_key(&table_id) {
                        del_table_raw(&mut inner, &table_id);
                    }
                }
                for (table_id, table) in tables {
                    apply_table(&mut inner, &table_id, table);
                }
            },
            None,
        );
        self
    }

    /// Replace one table. An empty payload is a no-op.
    pub fn set_table(&self, table_id: &str, table: Table) -> &Self {
        if table.is_empty() {
            return self;
        }
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_table(&mut inner, table_id, table);
            },
            None,
        );
        self
    }

    /// Replace one row.
    pub fn set_row(&self, table_id: &str, row_id: &str, row: Row) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_row(&mut inner, table_id, row_id, row, true);
            },
            None,
        );
        self
    }

    /// Merge cells into an existing (or new) row. Cells not mentioned are
    /// left alone.
    pub fn set_partial_row(&self, table_id: &str, row_id: &str, row: Row) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_row(&mut inner, table_id, row_id, row, false);
            },
            None,
        );
        self
    }

    /// Add a row under the lowest unused non-negative integer id, reusing
    /// gaps left by deletion. Returns the id if the row was stored.
    pub fn add_row(&self, table_id: &str, row: Row) -> Option<Id> {
        let mut added = None;
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                let row_id = next_free_row_id(&inner.tables, table_id);
                apply_row(&mut inner, table_id, &row_id, row.clone(), true);
                if inner
                    .tables
                    .get(table_id)
                    .is_some_and(|t| t.contains_key(&row_id))
                {
                    added = Some(row_id);
                }
            },
            None,
        );
        added
    }

    /// Set one cell from a literal.
    pub fn set_cell(
        &self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        cell: impl Into<Cell>,
    ) -> &Self {
        let cell = cell.into();
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_cell(&mut inner, table_id, row_id, cell_id, CellUpdate::Set(cell));
            },
            None,
        );
        self
    }

    /// Set one cell as a function of its live old value (mapped set).
    pub fn set_cell_map(
        &self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        f: impl FnOnce(Option<&Cell>) -> Cell,
    ) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_cell(
                    &mut inner,
                    table_id,
                    row_id,
                    cell_id,
                    CellUpdate::Map(Box::new(f)),
                );
            },
            None,
        );
        self
    }

    /// Replace the whole value container. An empty payload is a no-op.
    pub fn set_values(&self, values: Values) -> &Self {
        if values.is_empty() {
            return self;
        }
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_values(&mut inner, values, true);
            },
            None,
        );
        self
    }

    /// Merge values into the container. Values not mentioned are left alone.
    pub fn set_partial_values(&self, values: Values) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_values(&mut inner, values, false);
            },
            None,
        );
        self
    }

    /// Set one value from a literal.
    pub fn set_value(&self, value_id: &str, value: impl Into<Value>) -> &Self {
        let value = value.into();
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_value(&mut inner, value_id, CellUpdate::Set(value));
            },
            None,
        );
        self
    }

    /// Set one value as a function of its live old value.
    pub fn set_value_map(
        &self,
        value_id: &str,
        f: impl FnOnce(Option<&Value>) -> Value,
    ) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                apply_value(&mut inner, value_id, CellUpdate::Map(Box::new(f)));
            },
            None,
        );
        self
    }

    /// Delete every table.
    pub fn del_tables(&self) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                let table_ids: Vec<Id> = inner.tables.keys().cloned().collect();
                for table_id in table_ids {
                    del_table_raw(&mut inner, &table_id);
                }
            },
            None,
        );
        self
    }

    /// Delete one table.
    pub fn del_table(&self, table_id: &str) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                del_table_raw(&mut inner, table_id);
            },
            None,
        );
        self
    }

    /// Delete one row. Deleting a table's last row deletes the table.
    pub fn del_row(&self, table_id: &str, row_id: &str) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                del_row_raw(&mut inner, table_id, row_id);
            },
            None,
        );
        self
    }

    /// Delete one cell. Deleting a row's last cell deletes the row; a
    /// schema-declared default resets the cell instead of removing it.
    pub fn del_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                del_cell_checked(&mut inner, table_id, row_id, cell_id);
            },
            None,
        );
        self
    }

    /// Delete every value.
    pub fn del_values(&self) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                let value_ids: Vec<Id> = inner.values.keys().cloned().collect();
                for value_id in value_ids {
                    del_value_checked(&mut inner, &value_id);
                }
            },
            None,
        );
        self
    }

    /// Delete one value. A schema-declared default resets the value instead
    /// of removing it.
    pub fn del_value(&self, value_id: &str) -> &Self {
        self.transact(
            |store| {
                let mut inner = store.inner.borrow_mut();
                del_value_checked(&mut inner, value_id);
            },
            None,
        );
        self
    }

    // --- Schema ---

    /// Install (or clear, with `None`) both schemas wholesale. All current
    /// data is revalidated in the same transaction pass.
    pub fn set_schema(
        &self,
        tables_schema: Option<TablesSchema>,
        values_schema: Option<ValuesSchema>,
    ) -> &Self {
        debug!(
            has_tables_schema = tables_schema.is_some(),
            has_values_schema = values_schema.is_some(),
            "installing schema"
        );
        self.transact(
            move |store| {
                let mut inner = store.inner.borrow_mut();
                inner.tables_schema = tables_schema;
                inner.values_schema = values_schema;
                revalidate_tables(&mut inner);
                revalidate_values(&mut inner);
            },
            None,
        );
        self
    }

    /// Install just the tables schema, keeping any values schema.
    pub fn set_tables_schema(&self, tables_schema: TablesSchema) -> &Self {
        self.transact(
            move |store| {
                let mut inner = store.inner.borrow_mut();
                inner.tables_schema = Some(tables_schema);
                revalidate_tables(&mut inner);
            },
            None,
        );
        self
    }

    /// Install just the values schema, keeping any tables schema.
    pub fn set_values_schema(&self, values_schema: ValuesSchema) -> &Self {
        self.transact(
            move |store| {
                let mut inner = store.inner.borrow_mut();
                inner.values_schema = Some(values_schema);
                revalidate_values(&mut inner);
            },
            None,
        );
        self
    }

    /// Clear both schemas. Existing data is left as is.
    pub fn del_schema(&self) -> &Self {
        let mut inner = self.inner.borrow_mut();
        inner.tables_schema = None;
        inner.values_schema = None;
        drop(inner);
        self
    }

    // --- Transactions ---

    /// Run `actions` atomically. Nested calls fold into the outer
    /// transaction; only the outermost call settles and notifies listeners.
    pub fn transaction(&self, actions: impl FnOnce(&Store)) -> &Self {
        self.transact(actions, None);
        self
    }

    /// Like [`Store::transaction`], with a rollback predicate consulted after
    /// the mutator fixed point. Returning `true` reverts all data to the
    /// pre-transaction snapshot and suppresses every notification.
    pub fn transaction_with_rollback(
        &self,
        actions: impl FnOnce(&Store),
        do_rollback: impl FnOnce(&ChangedCells, &InvalidCells, &ChangedValues, &InvalidValues) -> bool,
    ) -> &Self {
        self.transact(actions, Some(Box::new(do_rollback)));
        self
    }

    fn transact(&self, actions: impl FnOnce(&Store), do_rollback: Option<RollbackFn<'_>>) {
        let opened = {
            let mut inner = self.inner.borrow_mut();
            if inner.tx.is_none() {
                trace!("opening transaction");
                inner.tx = Some(Transaction::open(
                    &inner.tables,
                    &inner.values,
                    &inner.tables_schema,
                    &inner.values_schema,
                ));
                true
            } else {
                false
            }
        };
        actions(self);
        if opened {
            self.settle(do_rollback);
        }
    }

    // --- Listeners ---

    /// Listen to any change anywhere under Tables.
    pub fn add_tables_listener(
        &self,
        is_mutator: bool,
        f: impl FnMut(&Store) + 'static,
    ) -> ListenerId {
        self.add(Callback::Tables(Rc::new(RefCell::new(f))), vec![], is_mutator)
    }

    /// Listen to the set of table ids changing.
    pub fn add_table_ids_listener(
        &self,
        is_mutator: bool,
        f: impl FnMut(&Store) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::TableIds(Rc::new(RefCell::new(f))),
            vec![],
            is_mutator,
        )
    }

    /// Listen to changes in one table (`None` = any table).
    pub fn add_table_listener(
        &self,
        table_id: Option<&str>,
        is_mutator: bool,
        f: impl FnMut(&Store, &str) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::Table(Rc::new(RefCell::new(f))),
            pattern(&[table_id]),
            is_mutator,
        )
    }

    /// Listen to the set of row ids in a table changing.
    pub fn add_row_ids_listener(
        &self,
        table_id: Option<&str>,
        is_mutator: bool,
        f: impl FnMut(&Store, &str) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::RowIds(Rc::new(RefCell::new(f))),
            pattern(&[table_id]),
            is_mutator,
        )
    }

    /// Listen to changes in one row (`None` components are wildcards).
    pub fn add_row_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        is_mutator: bool,
        f: impl FnMut(&Store, &str, &str) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::Row(Rc::new(RefCell::new(f))),
            pattern(&[table_id, row_id]),
            is_mutator,
        )
    }

    /// Listen to the set of cell ids in a row changing.
    pub fn add_cell_ids_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        is_mutator: bool,
        f: impl FnMut(&Store, &str, &str) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::CellIds(Rc::new(RefCell::new(f))),
            pattern(&[table_id, row_id]),
            is_mutator,
        )
    }

    /// Listen to changes of one cell (`None` components are wildcards). The
    /// callback receives the settled value and the pre-transaction value.
    pub fn add_cell_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        is_mutator: bool,
        f: impl FnMut(&Store, &str, &str, &str, Option<&Cell>, Option<&Cell>) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::Cell(Rc::new(RefCell::new(f))),
            pattern(&[table_id, row_id, cell_id]),
            is_mutator,
        )
    }

    /// Listen to any change anywhere under Values.
    pub fn add_values_listener(
        &self,
        is_mutator: bool,
        f: impl FnMut(&Store) + 'static,
    ) -> ListenerId {
        self.add(Callback::Values(Rc::new(RefCell::new(f))), vec![], is_mutator)
    }

    /// Listen to the set of value ids changing.
    pub fn add_value_ids_listener(
        &self,
        is_mutator: bool,
        f: impl FnMut(&Store) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::ValueIds(Rc::new(RefCell::new(f))),
            vec![],
            is_mutator,
        )
    }

    /// Listen to changes of one value (`None` = any value).
    pub fn add_value_listener(
        &self,
        value_id: Option<&str>,
        is_mutator: bool,
        f: impl FnMut(&Store, &str, Option<&Value>, Option<&Value>) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::Value(Rc::new(RefCell::new(f))),
            pattern(&[value_id]),
            is_mutator,
        )
    }

    /// Listen to rejected cell writes. Receives every rejected raw value
    /// seen for the coordinate during the transaction.
    pub fn add_invalid_cell_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        f: impl FnMut(&Store, &str, &str, &str, &[Cell]) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::InvalidCell(Rc::new(RefCell::new(f))),
            pattern(&[table_id, row_id, cell_id]),
            false,
        )
    }

    /// Listen to rejected value writes.
    pub fn add_invalid_value_listener(
        &self,
        value_id: Option<&str>,
        f: impl FnMut(&Store, &str, &[Value]) + 'static,
    ) -> ListenerId {
        self.add(
            Callback::InvalidValue(Rc::new(RefCell::new(f))),
            pattern(&[value_id]),
            false,
        )
    }

    fn add(&self, callback: Callback, pattern: Vec<Option<Id>>, is_mutator: bool) -> ListenerId {
        self.inner
            .borrow_mut()
            .registry
            .add(callback, pattern, is_mutator)
    }

    /// Remove a listener, releasing its id back to the pool. Unknown ids are
    /// a no-op.
    pub fn del_listener(&self, id: ListenerId) -> &Self {
        self.inner.borrow_mut().registry.remove(id);
        self
    }

    /// Synchronously invoke one listener once per concrete path it currently
    /// matches, against live data. The old-value argument is `None` in this
    /// mode. Unknown ids and invalid-write listeners are a no-op.
    pub fn call_listener(&self, id: ListenerId) -> &Self {
        let calls = {
            let inner = self.inner.borrow();
            match inner.registry.get(id) {
                None => Vec::new(),
                Some(entry) => enumerate_live(&inner, entry.callback.kind(), &entry.pattern),
            }
        };
        for call in calls {
            self.invoke(id, call);
        }
        self
    }

    /// Per-kind count of live listeners. Populated only in debug builds.
    pub fn listener_stats(&self) -> ListenerStats {
        self.inner.borrow().registry.stats()
    }

    // --- Settle ---

    fn settle(&self, do_rollback: Option<RollbackFn<'_>>) {
        // Mutator fixed point: iterative work batches, never recursion.
        loop {
            let batch = self.collect_mutator_batch();
            if batch.is_empty() {
                break;
            }
            trace!(invocations = batch.len(), "mutator pass");
            for (id, call) in batch {
                self.invoke(id, call);
            }
        }

        let (changed_cells, changed_values) = {
            let inner = self.inner.borrow();
            let tx = inner.tx.as_ref().expect("settle without transaction");
            net_diff(&inner, tx)
        };

        if let Some(predicate) = do_rollback {
            let (invalid_cells, invalid_values) = {
                let inner = self.inner.borrow();
                let tx = inner.tx.as_ref().expect("settle without transaction");
                (
                    tx.invalid_cells
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<InvalidCells>(),
                    tx.invalid_values
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<InvalidValues>(),
                )
            };
            if predicate(&changed_cells, &invalid_cells, &changed_values, &invalid_values) {
                debug!("transaction rolled back");
                let mut inner = self.inner.borrow_mut();
                let tx = inner.tx.take().expect("settle without transaction");
                inner.tables = tx.snapshot_tables;
                inner.values = tx.snapshot_values;
                inner.tables_schema = tx.snapshot_tables_schema;
                inner.values_schema = tx.snapshot_values_schema;
                return;
            }
        }

        let plan = {
            let inner = self.inner.borrow();
            let tx = inner.tx.as_ref().expect("settle without transaction");
            plan_listener_pass(&inner, tx, &changed_cells, &changed_values)
        };
        debug!(
            changed_cells = changed_cells.len(),
            changed_values = changed_values.len(),
            invocations = plan.len(),
            "settling transaction"
        );
        for (id, call) in plan {
            self.invoke(id, call);
        }

        let invalid_plan = {
            let inner = self.inner.borrow();
            let tx = inner.tx.as_ref().expect("settle without transaction");
            plan_invalid_pass(&inner, tx)
        };
        for (id, call) in invalid_plan {
            self.invoke(id, call);
        }

        self.inner.borrow_mut().tx = None;
    }

    /// One batch of not-yet-fired mutator invocations, deepest level first.
    /// Marks each `(listener, coordinate)` pair as fired before returning.
    fn collect_mutator_batch(&self) -> Vec<(ListenerId, Call)> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let tx = match inner.tx.as_mut() {
            Some(tx) => tx,
            None => return Vec::new(),
        };
        let mut batch = Vec::new();

        let touched_cells: Vec<CellCoord> = tx.touched_cells().to_vec();
        let touched_rows = tx.touched_rows();
        let touched_tables = tx.touched_tables();
        let touched_values: Vec<Id> = tx.touched_values().to_vec();

        for (t, r, c) in &touched_cells {
            for id in inner
                .registry
                .matches(ListenerKind::Cell, &[t.as_str(), r.as_str(), c.as_str()])
            {
                let entry = inner.registry.get(id).expect("matched listener");
                if !entry.is_mutator {
                    continue;
                }
                let at = FiredAt::Cell((t.clone(), r.clone(), c.clone()));
                if tx.fired.insert((id, at)) {
                    let new = cell_in(&inner.tables, t, r, c).cloned();
                    let old = cell_in(&tx.snapshot_tables, t, r, c).cloned();
                    batch.push((id, Call::Cell(t.clone(), r.clone(), c.clone(), new, old)));
                }
            }
        }
        for (t, r) in &touched_rows {
            for id in inner
                .registry
                .matches(ListenerKind::CellIds, &[t.as_str(), r.as_str()])
            {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator
                    && tx.fired.insert((id, FiredAt::CellIds((t.clone(), r.clone()))))
                {
                    batch.push((id, Call::CellIds(t.clone(), r.clone())));
                }
            }
        }
        for (t, r) in &touched_rows {
            for id in inner
                .registry
                .matches(ListenerKind::Row, &[t.as_str(), r.as_str()])
            {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::Row((t.clone(), r.clone())))) {
                    batch.push((id, Call::Row(t.clone(), r.clone())));
                }
            }
        }
        for t in &touched_tables {
            for id in inner.registry.matches(ListenerKind::RowIds, &[t.as_str()]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::RowIds(t.clone()))) {
                    batch.push((id, Call::RowIds(t.clone())));
                }
            }
        }
        for t in &touched_tables {
            for id in inner.registry.matches(ListenerKind::Table, &[t.as_str()]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::Table(t.clone()))) {
                    batch.push((id, Call::Table(t.clone())));
                }
            }
        }
        if !touched_cells.is_empty() {
            for id in inner.registry.matches(ListenerKind::TableIds, &[]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::TableIds)) {
                    batch.push((id, Call::TableIds));
                }
            }
            for id in inner.registry.matches(ListenerKind::Tables, &[]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::Tables)) {
                    batch.push((id, Call::Tables));
                }
            }
        }
        for v in &touched_values {
            for id in inner.registry.matches(ListenerKind::Value, &[v.as_str()]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::Value(v.clone()))) {
                    let new = inner.values.get(v).cloned();
                    let old = tx.snapshot_values.get(v).cloned();
                    batch.push((id, Call::Value(v.clone(), new, old)));
                }
            }
        }
        if !touched_values.is_empty() {
            for id in inner.registry.matches(ListenerKind::ValueIds, &[]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::ValueIds)) {
                    batch.push((id, Call::ValueIds));
                }
            }
            for id in inner.registry.matches(ListenerKind::Values, &[]) {
                let entry = inner.registry.get(id).expect("matched listener");
                if entry.is_mutator && tx.fired.insert((id, FiredAt::Values)) {
                    batch.push((id, Call::Values));
                }
            }
        }

        batch
    }

    fn invoke(&self, id: ListenerId, call: Call) {
        let callback = {
            let inner = self.inner.borrow();
            match inner.registry.get(id) {
                // Deleted mid-settle by an earlier callback.
                None => return,
                Some(entry) => entry.callback.clone(),
            }
        };
        // try_borrow_mut: a callback that re-enters itself (e.g. via
        // call_listener on its own id) is skipped rather than panicking.
        match (callback, call) {
            (Callback::Tables(cb), Call::Tables) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self);
                }
            }
            (Callback::TableIds(cb), Call::TableIds) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self);
                }
            }
            (Callback::Table(cb), Call::Table(t)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &t);
                }
            }
            (Callback::RowIds(cb), Call::RowIds(t)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &t);
                }
            }
            (Callback::Row(cb), Call::Row(t, r)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &t, &r);
                }
            }
            (Callback::CellIds(cb), Call::CellIds(t, r)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &t, &r);
                }
            }
            (Callback::Cell(cb), Call::Cell(t, r, c, new, old)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &t, &r, &c, new.as_ref(), old.as_ref());
                }
            }
            (Callback::Values(cb), Call::Values) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self);
                }
            }
            (Callback::ValueIds(cb), Call::ValueIds) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self);
                }
            }
            (Callback::Value(cb), Call::Value(v, new, old)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &v, new.as_ref(), old.as_ref());
                }
            }
            (Callback::InvalidCell(cb), Call::InvalidCell(t, r, c, raws)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &t, &r, &c, &raws);
                }
            }
            (Callback::InvalidValue(cb), Call::InvalidValue(v, raws)) => {
                if let Ok(mut f) = cb.try_borrow_mut() {
                    (&mut *f)(self, &v, &raws);
                }
            }
            _ => debug_assert!(false, "listener kind and call mismatch"),
        }
    }
}

// --- Write core (all primitives normalize then land here) ---

fn cell_in<'a>(tables: &'a Tables, t: &str, r: &str, c: &str) -> Option<&'a Cell> {
    tables.get(t).and_then(|tb| tb.get(r)).and_then(|row| row.get(c))
}

/// Set one scalar, touching its coordinate only on an actual change.
fn write_cell_raw(inner: &mut Inner, t: &str, r: &str, c: &str, cell: Cell) {
    let Inner { tables, tx, .. } = inner;
    let row = tables
        .entry(t.to_string())
        .or_default()
        .entry(r.to_string())
        .or_default();
    if row.get(c) != Some(&cell) {
        row.insert(c.to_string(), cell);
        if let Some(tx) = tx.as_mut() {
            tx.touch_cell(t, r, c);
        }
    }
}

/// Delete one scalar, cascading emptied rows and tables eagerly.
fn del_cell_raw(inner: &mut Inner, t: &str, r: &str, c: &str) {
    let Inner { tables, tx, .. } = inner;
    let Some(table) = tables.get_mut(t) else {
        return;
    };
    let Some(row) = table.get_mut(r) else {
        return;
    };
    if row.remove(c).is_some() {
        if let Some(tx) = tx.as_mut() {
            tx.touch_cell(t, r, c);
        }
        if row.is_empty() {
            table.remove(r);
            if table.is_empty() {
                tables.remove(t);
            }
        }
    }
}

/// Delete one scalar, resetting to the schema default when one is declared.
fn del_cell_checked(inner: &mut Inner, t: &str, r: &str, c: &str) {
    if cell_in(&inner.tables, t, r, c).is_none() {
        return;
    }
    let default = inner
        .tables_schema
        .as_ref()
        .and_then(|s| s.get(t))
        .and_then(|cells| cells.get(c))
        .and_then(|decl| decl.default.clone());
    match default {
        Some(default) => write_cell_raw(inner, t, r, c, default),
        None => del_cell_raw(inner, t, r, c),
    }
}

fn del_row_raw(inner: &mut Inner, t: &str, r: &str) {
    let cell_ids: Vec<Id> = match inner.tables.get(t).and_then(|tb| tb.get(r)) {
        Some(row) => row.keys().cloned().collect(),
        None => return,
    };
    for c in cell_ids {
        del_cell_raw(inner, t, r, &c);
    }
}

fn del_table_raw(inner: &mut Inner, t: &str) {
    let row_ids: Vec<Id> = match inner.tables.get(t) {
        Some(table) => table.keys().cloned().collect(),
        None => return,
    };
    for r in row_ids {
        del_row_raw(inner, t, &r);
    }
}

/// Fill schema-declared defaults into the absent cells of an existing row.
fn fill_row_defaults(inner: &mut Inner, t: &str, r: &str) {
    let defaults: Vec<(Id, Cell)> = schema::table_defaults(inner.tables_schema.as_ref(), t)
        .into_iter()
        .map(|(id, cell)| (id.clone(), cell.clone()))
        .collect();
    if defaults.is_empty() || !inner.tables.get(t).is_some_and(|tb| tb.contains_key(r)) {
        return;
    }
    for (c, default) in defaults {
        if cell_in(&inner.tables, t, r, &c).is_none() {
            write_cell_raw(inner, t, r, &c, default);
        }
    }
}

fn apply_cell(inner: &mut Inner, t: &str, r: &str, c: &str, update: CellUpdate<'_>) {
    let old = cell_in(&inner.tables, t, r, c).cloned();
    let cell = update.resolve(old.as_ref());
    match schema::check_cell(inner.tables_schema.as_ref(), t, c, &cell) {
        Checked::Accept => {
            write_cell_raw(inner, t, r, c, cell);
            fill_row_defaults(inner, t, r);
        }
        Checked::Reject { replacement } => {
            if let Some(tx) = inner.tx.as_mut() {
                tx.log_invalid_cell(t, r, c, cell);
            }
            // A rejected write never disturbs an existing cell; a declared
            // default may seed an absent one.
            if old.is_none() {
                if let Some(replacement) = replacement {
                    write_cell_raw(inner, t, r, c, replacement);
                    fill_row_defaults(inner, t, r);
                }
            }
        }
    }
}

/// Apply a row write. `replace` deletes unmentioned cells; otherwise the
/// write merges. Rejected cells are reported invalid and excluded.
fn apply_row(inner: &mut Inner, t: &str, r: &str, row: Row, replace: bool) {
    if row.is_empty() {
        return;
    }
    let mut accepted: Vec<(Id, Cell)> = Vec::new();
    for (c, cell) in row {
        match schema::check_cell(inner.tables_schema.as_ref(), t, &c, &cell) {
            Checked::Accept => accepted.push((c, cell)),
            Checked::Reject { replacement } => {
                let existing = cell_in(&inner.tables, t, r, &c).is_some();
                if let Some(tx) = inner.tx.as_mut() {
                    tx.log_invalid_cell(t, r, &c, cell);
                }
                if let Some(replacement) = replacement {
                    if replace || !existing {
                        accepted.push((c, replacement));
                    }
                }
            }
        }
    }

    if accepted.is_empty() {
        // A row that is empty after rejection is not created; replacing an
        // existing row with nothing deletes it (cascade).
        if replace {
            del_row_raw(inner, t, r);
        }
        return;
    }

    let kept: HashSet<Id> = accepted.iter().map(|(c, _)| c.clone()).collect();
    for (c, cell) in accepted {
        write_cell_raw(inner, t, r, &c, cell);
    }
    if replace {
        let extras: Vec<Id> = inner
            .tables
            .get(t)
            .and_then(|tb| tb.get(r))
            .map(|row| row.keys().filter(|c| !kept.contains(*c)).cloned().collect())
            .unwrap_or_default();
        for c in extras {
            del_cell_raw(inner, t, r, &c);
        }
    }
    fill_row_defaults(inner, t, r);
}

/// Apply a table write: replaces the table's row set.
fn apply_table(inner: &mut Inner, t: &str, table: Table) {
    let existing: Vec<Id> = inner
        .tables
        .get(t)
        .map(|tb| tb.keys().cloned().collect())
        .unwrap_or_default();
    for r in existing {
        if !table.contains_key(&r) {
            del_row_raw(inner, t, &r);
        }
    }
    for (r, row) in table {
        if !row.is_empty() {
            apply_row(inner, t, &r, row, true);
        } else {
            del_row_raw(inner, t, &r);
        }
    }
}

fn apply_value(inner: &mut Inner, v: &str, update: CellUpdate<'_>) {
    let old = inner.values.get(v).cloned();
    let value = update.resolve(old.as_ref());
    match schema::check_value(inner.values_schema.as_ref(), v, &value) {
        Checked::Accept => write_value_raw(inner, v, value),
        Checked::Reject { replacement } => {
            if let Some(tx) = inner.tx.as_mut() {
                tx.log_invalid_value(v, value);
            }
            if old.is_none() {
                if let Some(replacement) = replacement {
                    write_value_raw(inner, v, replacement);
                }
            }
        }
    }
}

fn apply_values(inner: &mut Inner, values: Values, replace: bool) {
    let mut accepted: Vec<(Id, Value)> = Vec::new();
    for (v, value) in values {
        match schema::check_value(inner.values_schema.as_ref(), &v, &value) {
            Checked::Accept => accepted.push((v, value)),
            Checked::Reject { replacement } => {
                let existing = inner.values.contains_key(&v);
                if let Some(tx) = inner.tx.as_mut() {
                    tx.log_invalid_value(&v, value);
                }
                if let Some(replacement) = replacement {
                    if replace || !existing {
                        accepted.push((v, replacement));
                    }
                }
            }
        }
    }
    let kept: HashSet<Id> = accepted.iter().map(|(v, _)| v.clone()).collect();
    if replace {
        let extras: Vec<Id> = inner
            .values
            .keys()
            .filter(|v| !kept.contains(*v))
            .cloned()
            .collect();
        for v in extras {
            del_value_raw(inner, &v);
        }
    }
    for (v, value) in accepted {
        write_value_raw(inner, &v, value);
    }
    fill_value_defaults(inner);
}

fn write_value_raw(inner: &mut Inner, v: &str, value: Value) {
    let Inner { values, tx, .. } = inner;
    if values.get(v) != Some(&value) {
        values.insert(v.to_string(), value);
        if let Some(tx) = tx.as_mut() {
            tx.touch_value(v);
        }
    }
}

fn del_value_raw(inner: &mut Inner, v: &str) {
    let Inner { values, tx, .. } = inner;
    if values.remove(v).is_some() {
        if let Some(tx) = tx.as_mut() {
            tx.touch_value(v);
        }
    }
}

fn del_value_checked(inner: &mut Inner, v: &str) {
    if !inner.values.contains_key(v) {
        return;
    }
    let default = inner
        .values_schema
        .as_ref()
        .and_then(|s| s.get(v))
        .and_then(|decl| decl.default.clone());
    match default {
        Some(default) => write_value_raw(inner, v, default),
        None => del_value_raw(inner, v),
    }
}

/// Seed every declared-with-default value that is currently absent.
fn fill_value_defaults(inner: &mut Inner) {
    let defaults: Vec<(Id, Value)> = match inner.values_schema.as_ref() {
        None => return,
        Some(schema) => schema
            .iter()
            .filter_map(|(v, decl)| decl.default.clone().map(|d| (v.clone(), d)))
            .collect(),
    };
    for (v, default) in defaults {
        if !inner.values.contains_key(&v) {
            write_value_raw(inner, &v, default);
        }
    }
}

/// Revalidate all table data against a freshly installed tables schema.
fn revalidate_tables(inner: &mut Inner) {
    let Some(schema) = inner.tables_schema.clone() else {
        return;
    };
    let table_ids: Vec<Id> = inner.tables.keys().cloned().collect();
    for t in table_ids {
        if !schema.contains_key(&t) {
            // Entire undeclared table dropped; every cell reported invalid.
            let rows: Vec<(Id, Row)> = inner
                .tables
                .get(&t)
                .map(|tb| tb.iter().map(|(r, row)| (r.clone(), row.clone())).collect())
                .unwrap_or_default();
            for (r, row) in rows {
                for (c, cell) in row {
                    if let Some(tx) = inner.tx.as_mut() {
                        tx.log_invalid_cell(&t, &r, &c, cell);
                    }
                }
            }
            del_table_raw(inner, &t);
            continue;
        }
        let row_ids: Vec<Id> = inner
            .tables
            .get(&t)
            .map(|tb| tb.keys().cloned().collect())
            .unwrap_or_default();
        for r in row_ids {
            let cells: Vec<(Id, Cell)> = inner
                .tables
                .get(&t)
                .and_then(|tb| tb.get(&r))
                .map(|row| row.iter().map(|(c, cell)| (c.clone(), cell.clone())).collect())
                .unwrap_or_default();
            for (c, cell) in cells {
                match schema::check_cell(Some(&schema), &t, &c, &cell) {
                    Checked::Accept => {}
                    Checked::Reject { replacement } => {
                        if let Some(tx) = inner.tx.as_mut() {
                            tx.log_invalid_cell(&t, &r, &c, cell);
                        }
                        match replacement {
                            Some(replacement) => write_cell_raw(inner, &t, &r, &c, replacement),
                            None => del_cell_raw(inner, &t, &r, &c),
                        }
                    }
                }
            }
            fill_row_defaults(inner, &t, &r);
        }
    }
}

/// Revalidate all values against a freshly installed values schema.
fn revalidate_values(inner: &mut Inner) {
    let Some(schema) = inner.values_schema.clone() else {
        return;
    };
    let value_ids: Vec<Id> = inner.values.keys().cloned().collect();
    for v in value_ids {
        let value = inner.values.get(&v).cloned().expect("value id just listed");
        match schema::check_value(Some(&schema), &v, &value) {
            Checked::Accept => {}
            Checked::Reject { replacement } => {
                if let Some(tx) = inner.tx.as_mut() {
                    tx.log_invalid_value(&v, value);
                }
                match replacement {
                    Some(replacement) => write_value_raw(inner, &v, replacement),
                    None => del_value_raw(inner, &v),
                }
            }
        }
    }
    fill_value_defaults(inner);
}

/// Lowest unused non-negative integer id in a table, as a decimal string.
fn next_free_row_id(tables: &Tables, t: &str) -> Id {
    let table = tables.get(t);
    let mut candidate: u64 = 0;
    loop {
        let id = candidate.to_string();
        if !table.is_some_and(|tb| tb.contains_key(&id)) {
            return id;
        }
        candidate += 1;
    }
}

// --- Settle helpers ---

/// Net diff of the transaction against its snapshot. Coordinates whose final
/// value equals the pre-transaction value are dropped.
fn net_diff(inner: &Inner, tx: &Transaction) -> (ChangedCells, ChangedValues) {
    let mut changed_cells = ChangedCells::new();
    for (t, r, c) in tx.touched_cells() {
        let old = cell_in(&tx.snapshot_tables, t, r, c).cloned();
        let new = cell_in(&inner.tables, t, r, c).cloned();
        if old != new {
            changed_cells.insert((t.clone(), r.clone(), c.clone()), (old, new));
        }
    }
    let mut changed_values = ChangedValues::new();
    for v in tx.touched_values() {
        let old = tx.snapshot_values.get(v).cloned();
        let new = inner.values.get(v).cloned();
        if old != new {
            changed_values.insert(v.clone(), (old, new));
        }
    }
    (changed_cells, changed_values)
}

fn key_set_differs<K: Ord, A, B>(
    a: Option<&std::collections::BTreeMap<K, A>>,
    b: Option<&std::collections::BTreeMap<K, B>>,
) -> bool {
    match (a, b) {
        (None, None) => false,
        (Some(a), Some(b)) => !a.keys().eq(b.keys()),
        _ => true,
    }
}

/// Non-mutator invocations for the settled net diff: deepest level first
/// within a coordinate, first-touch order across coordinates.
fn plan_listener_pass(
    inner: &Inner,
    tx: &Transaction,
    changed_cells: &ChangedCells,
    changed_values: &ChangedValues,
) -> Vec<(ListenerId, Call)> {
    let mut plan = Vec::new();
    let registry = &inner.registry;

    let cells: Vec<CellCoord> = tx
        .touched_cells()
        .iter()
        .filter(|coord| changed_cells.contains_key(*coord))
        .cloned()
        .collect();
    let mut rows: Vec<RowCoord> = Vec::new();
    let mut row_seen = HashSet::new();
    let mut tables: Vec<Id> = Vec::new();
    let mut table_seen = HashSet::new();
    for (t, r, _) in &cells {
        if row_seen.insert((t.clone(), r.clone())) {
            rows.push((t.clone(), r.clone()));
        }
        if table_seen.insert(t.clone()) {
            tables.push(t.clone());
        }
    }

    let non_mutators = |ids: Vec<ListenerId>| {
        ids.into_iter()
            .filter(|id| registry.get(*id).is_some_and(|e| !e.is_mutator))
            .collect::<Vec<_>>()
    };

    for coord in &cells {
        let (t, r, c) = coord;
        let (old, new) = changed_cells.get(coord).expect("planned coordinate").clone();
        for id in non_mutators(registry.matches(
            ListenerKind::Cell,
            &[t.as_str(), r.as_str(), c.as_str()],
        )) {
            plan.push((
                id,
                Call::Cell(t.clone(), r.clone(), c.clone(), new.clone(), old.clone()),
            ));
        }
    }
    for (t, r) in &rows {
        let snap_row = tx.snapshot_tables.get(t).and_then(|tb| tb.get(r));
        let live_row = inner.tables.get(t).and_then(|tb| tb.get(r));
        if key_set_differs(snap_row, live_row) {
            for id in
                non_mutators(registry.matches(ListenerKind::CellIds, &[t.as_str(), r.as_str()]))
            {
                plan.push((id, Call::CellIds(t.clone(), r.clone())));
            }
        }
    }
    for (t, r) in &rows {
        for id in non_mutators(registry.matches(ListenerKind::Row, &[t.as_str(), r.as_str()])) {
            plan.push((id, Call::Row(t.clone(), r.clone())));
        }
    }
    for t in &tables {
        if key_set_differs(tx.snapshot_tables.get(t), inner.tables.get(t)) {
            for id in non_mutators(registry.matches(ListenerKind::RowIds, &[t.as_str()])) {
                plan.push((id, Call::RowIds(t.clone())));
            }
        }
    }
    for t in &tables {
        for id in non_mutators(registry.matches(ListenerKind::Table, &[t.as_str()])) {
            plan.push((id, Call::Table(t.clone())));
        }
    }
    if !cells.is_empty() {
        if key_set_differs(Some(&tx.snapshot_tables), Some(&inner.tables)) {
            for id in non_mutators(registry.matches(ListenerKind::TableIds, &[])) {
                plan.push((id, Call::TableIds));
            }
        }
        for id in non_mutators(registry.matches(ListenerKind::Tables, &[])) {
            plan.push((id, Call::Tables));
        }
    }

    let values: Vec<Id> = tx
        .touched_values()
        .iter()
        .filter(|v| changed_values.contains_key(*v))
        .cloned()
        .collect();
    for v in &values {
        let (old, new) = changed_values.get(v).expect("planned value").clone();
        for id in non_mutators(registry.matches(ListenerKind::Value, &[v.as_str()])) {
            plan.push((id, Call::Value(v.clone(), new.clone(), old.clone())));
        }
    }
    if !values.is_empty() {
        if key_set_differs(Some(&tx.snapshot_values), Some(&inner.values)) {
            for id in non_mutators(registry.matches(ListenerKind::ValueIds, &[])) {
                plan.push((id, Call::ValueIds));
            }
        }
        for id in non_mutators(registry.matches(ListenerKind::Values, &[])) {
            plan.push((id, Call::Values));
        }
    }

    plan
}

/// Invalid-write invocations; these are not collapsed by the net diff.
fn plan_invalid_pass(inner: &Inner, tx: &Transaction) -> Vec<(ListenerId, Call)> {
    let mut plan = Vec::new();
    for ((t, r, c), raws) in &tx.invalid_cells {
        for id in inner.registry.matches(
            ListenerKind::InvalidCell,
            &[t.as_str(), r.as_str(), c.as_str()],
        ) {
            plan.push((
                id,
                Call::InvalidCell(t.clone(), r.clone(), c.clone(), raws.clone()),
            ));
        }
    }
    for (v, raws) in &tx.invalid_values {
        for id in inner
            .registry
            .matches(ListenerKind::InvalidValue, &[v.as_str()])
        {
            plan.push((id, Call::InvalidValue(v.clone(), raws.clone())));
        }
    }
    plan
}

/// Concrete live paths matched by one listener's pattern, for
/// [`Store::call_listener`].
fn enumerate_live(
    inner: &Inner,
    kind: ListenerKind,
    pat: &[Option<Id>],
) -> Vec<Call> {
    let table_ids = |pat: Option<&Option<Id>>| -> Vec<Id> {
        match pat.and_then(|p| p.as_ref()) {
            Some(t) => {
                if inner.tables.contains_key(t) {
                    vec![t.clone()]
                } else {
                    Vec::new()
                }
            }
            None => inner.tables.keys().cloned().collect(),
        }
    };
    match kind {
        ListenerKind::Tables => vec![Call::Tables],
        ListenerKind::TableIds => vec![Call::TableIds],
        ListenerKind::Values => vec![Call::Values],
        ListenerKind::ValueIds => vec![Call::ValueIds],
        ListenerKind::Table => table_ids(pat.first()).into_iter().map(Call::Table).collect(),
        ListenerKind::RowIds => table_ids(pat.first()).into_iter().map(Call::RowIds).collect(),
        ListenerKind::Row | ListenerKind::CellIds => {
            let mut calls = Vec::new();
            for t in table_ids(pat.first()) {
                let row_ids: Vec<Id> = match pat.get(1).and_then(|p| p.as_ref()) {
                    Some(r) => {
                        if inner.tables[&t].contains_key(r) {
                            vec![r.clone()]
                        } else {
                            Vec::new()
                        }
                    }
                    None => inner.tables[&t].keys().cloned().collect(),
                };
                for r in row_ids {
                    calls.push(match kind {
                        ListenerKind::Row => Call::Row(t.clone(), r),
                        _ => Call::CellIds(t.clone(), r),
                    });
                }
            }
            calls
        }
        ListenerKind::Cell => {
            let mut calls = Vec::new();
            for t in table_ids(pat.first()) {
                let row_ids: Vec<Id> = match pat.get(1).and_then(|p| p.as_ref()) {
                    Some(r) => {
                        if inner.tables[&t].contains_key(r) {
                            vec![r.clone()]
                        } else {
                            Vec::new()
                        }
                    }
                    None => inner.tables[&t].keys().cloned().collect(),
                };
                for r in row_ids {
                    let cell_ids: Vec<Id> = match pat.get(2).and_then(|p| p.as_ref()) {
                        Some(c) => {
                            if inner.tables[&t][&r].contains_key(c) {
                                vec![c.clone()]
                            } else {
                                Vec::new()
                            }
                        }
                        None => inner.tables[&t][&r].keys().cloned().collect(),
                    };
                    for c in cell_ids {
                        let live = cell_in(&inner.tables, &t, &r, &c).cloned();
                        calls.push(Call::Cell(t.clone(), r.clone(), c, live, None));
                    }
                }
            }
            calls
        }
        ListenerKind::Value => {
            let value_ids: Vec<Id> = match pat.first().and_then(|p| p.as_ref()) {
                Some(v) => {
                    if inner.values.contains_key(v) {
                        vec![v.clone()]
                    } else {
                        Vec::new()
                    }
                }
                None => inner.values.keys().cloned().collect(),
            };
            value_ids
                .into_iter()
                .map(|v| {
                    let live = inner.values.get(&v).cloned();
                    Call::Value(v, live, None)
                })
                .collect()
        }
        // Invalid listeners have no concrete live data to enumerate.
        ListenerKind::InvalidCell | ListenerKind::InvalidValue => Vec::new(),
    }
}

fn pattern(components: &[Option<&str>]) -> Vec<Option<Id>> {
    components
        .iter()
        .map(|c| c.map(|s| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[(&str, Cell)]) -> Row {
        cells
            .iter()
            .map(|(c, cell)| (c.to_string(), cell.clone()))
            .collect()
    }

    #[test]
    fn test_set_and_get_cell() {
        let store = Store::new();
        store.set_cell("t1", "r1", "c1", 1);
        assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
        assert!(store.has_table("t1"));
        assert!(store.has_row("t1", "r1"));
    }

    #[test]
    fn test_cascade_delete() {
        let store = Store::new();
        store.set_cell("t1", "r1", "c1", 1);
        store.del_cell("t1", "r1", "c1");
        assert!(!store.has_row("t1", "r1"));
        assert!(!store.has_table("t1"));
    }

    #[test]
    fn test_mapped_set_resolves_against_live_value() {
        let store = Store::new();
        store.set_cell("t1", "r1", "c1", 10);
        store.set_cell_map("t1", "r1", "c1", |old| {
            Cell::from(old.and_then(Cell::as_number).unwrap_or(0.0) + 5.0)
        });
        assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(15)));
    }

    #[test]
    fn test_add_row_fills_gaps() {
        let store = Store::new();
        store.set_row("t1", "r1", row(&[("c1", Cell::from(0))]));
        assert_eq!(store.add_row("t1", row(&[("c1", Cell::from(1))])), Some("0".to_string()));
        assert_eq!(store.add_row("t1", row(&[("c1", Cell::from(2))])), Some("1".to_string()));
        assert_eq!(store.add_row("t1", row(&[("c1", Cell::from(3))])), Some("2".to_string()));

        store.del_row("t1", "1");
        assert_eq!(store.add_row("t1", row(&[("c1", Cell::from(4))])), Some("1".to_string()));
    }

    #[test]
    fn test_empty_row_is_noop() {
        let store = Store::new();
        assert_eq!(store.add_row("t1", Row::new()), None);
        store.set_row("t1", "r1", Row::new());
        assert!(!store.has_table("t1"));
    }

    #[test]
    fn test_json_round_trip() {
        let store = Store::new();
        store.set_cell("t1", "r1", "c1", "x");
        store.set_value("v1", true);

        let json = store.get_json();
        let other = Store::new();
        other.set_json(&json).unwrap();
        assert_eq!(other.get_tables(), store.get_tables());
        assert_eq!(other.get_values(), store.get_values());
    }

    #[test]
    fn test_malformed_json_leaves_store_unchanged() {
        let store = Store::new();
        store.set_cell("t1", "r1", "c1", 1);
        assert!(store.set_json("[{\"t1\":").is_err());
        assert!(store.set_json("{\"not\":\"an array\"}").is_err());
        assert_eq!(store.get_cell("t1", "r1", "c1"), Some(Cell::from(1)));
    }
}
