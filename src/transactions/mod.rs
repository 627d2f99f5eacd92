//! Transaction state: pre-transaction snapshot, touch logs, diff types.
//!
//! A transaction records which coordinates were touched, in first-touch
//! order, plus every rejected raw write. The net diff is always recomputed
//! against the snapshot at settle time, so sequences of writes that cancel
//! out produce no diff entry at all.

use crate::listeners::ListenerId;
use crate::schema::{TablesSchema, ValuesSchema};
use crate::types::{Cell, CellCoord, Id, RowCoord, Tables, Value, Values};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Net cell changes keyed by coordinate: `(old, new)` against the snapshot.
pub type ChangedCells = HashMap<CellCoord, (Option<Cell>, Option<Cell>)>;

/// Every rejected raw cell write, keyed by target coordinate.
pub type InvalidCells = HashMap<CellCoord, Vec<Cell>>;

/// Net value changes keyed by value id: `(old, new)` against the snapshot.
pub type ChangedValues = HashMap<Id, (Option<Value>, Option<Value>)>;

/// Every rejected raw value write, keyed by value id.
pub type InvalidValues = HashMap<Id, Vec<Value>>;

/// The concrete coordinate a listener fired for during one settle.
///
/// A mutator is invoked at most once per `(listener, coordinate)` pair per
/// settle; this key is what makes self-mutating mutators terminate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum FiredAt {
    Cell(CellCoord),
    CellIds(RowCoord),
    Row(RowCoord),
    RowIds(Id),
    Table(Id),
    TableIds,
    Tables,
    Value(Id),
    ValueIds,
    Values,
}

/// State of the single active transaction.
pub(crate) struct Transaction {
    pub snapshot_tables: Tables,
    pub snapshot_values: Values,
    pub snapshot_tables_schema: Option<TablesSchema>,
    pub snapshot_values_schema: Option<ValuesSchema>,

    touched_cells: Vec<CellCoord>,
    touched_cell_set: HashSet<CellCoord>,
    touched_values: Vec<Id>,
    touched_value_set: HashSet<Id>,

    pub invalid_cells: BTreeMap<CellCoord, Vec<Cell>>,
    pub invalid_values: BTreeMap<Id, Vec<Value>>,

    /// `(listener, coordinate)` pairs already invoked this settle.
    pub fired: HashSet<(ListenerId, FiredAt)>,
}

impl Transaction {
    pub fn open(
        tables: &Tables,
        values: &Values,
        tables_schema: &Option<TablesSchema>,
        values_schema: &Option<ValuesSchema>,
    ) -> Self {
        Self {
            snapshot_tables: tables.clone(),
            snapshot_values: values.clone(),
            snapshot_tables_schema: tables_schema.clone(),
            snapshot_values_schema: values_schema.clone(),
            touched_cells: Vec::new(),
            touched_cell_set: HashSet::new(),
            touched_values: Vec::new(),
            touched_value_set: HashSet::new(),
            invalid_cells: BTreeMap::new(),
            invalid_values: BTreeMap::new(),
            fired: HashSet::new(),
        }
    }

    /// Record a cell coordinate as touched. Repeated touches keep the
    /// first-touch position; the log is keyed by final coordinate only.
    pub fn touch_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) {
        let coord = (
            table_id.to_string(),
            row_id.to_string(),
            cell_id.to_string(),
        );
        if self.touched_cell_set.insert(coord.clone()) {
            self.touched_cells.push(coord);
        }
    }

    pub fn touch_value(&mut self, value_id: &str) {
        if self.touched_value_set.insert(value_id.to_string()) {
            self.touched_values.push(value_id.to_string());
        }
    }

    pub fn log_invalid_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, raw: Cell) {
        self.invalid_cells
            .entry((
                table_id.to_string(),
                row_id.to_string(),
                cell_id.to_string(),
            ))
            .or_default()
            .push(raw);
    }

    pub fn log_invalid_value(&mut self, value_id: &str, raw: Value) {
        self.invalid_values
            .entry(value_id.to_string())
            .or_default()
            .push(raw);
    }

    /// Touched cell coordinates in first-touch order.
    pub fn touched_cells(&self) -> &[CellCoord] {
        &self.touched_cells
    }

    /// Touched value ids in first-touch order.
    pub fn touched_values(&self) -> &[Id] {
        &self.touched_values
    }

    /// Touched row coordinates, deduplicated, in first-touch order.
    pub fn touched_rows(&self) -> Vec<RowCoord> {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for (table_id, row_id, _) in &self.touched_cells {
            let coord = (table_id.clone(), row_id.clone());
            if seen.insert(coord.clone()) {
                rows.push(coord);
            }
        }
        rows
    }

    /// Touched table ids, deduplicated, in first-touch order.
    pub fn touched_tables(&self) -> Vec<Id> {
        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        for (table_id, _, _) in &self.touched_cells {
            if seen.insert(table_id.clone()) {
                tables.push(table_id.clone());
            }
        }
        tables
    }

    pub fn has_touches(&self) -> bool {
        !self.touched_cells.is_empty()
            || !self.touched_values.is_empty()
            || !self.invalid_cells.is_empty()
            || !self.invalid_values.is_empty()
    }
}
