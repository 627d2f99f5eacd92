//! Optional schema: per-cell and per-value type declarations with defaults.
//!
//! Schema is type + default only. Richer constraints (bounds, allow-lists)
//! belong in mutator listeners installed by the caller, which run in the same
//! settle and can clamp or revert values.

use crate::types::{Cell, CellKind, Id, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declaration for a single cell position within a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSchema {
    /// Required scalar kind.
    #[serde(rename = "type")]
    pub kind: CellKind,

    /// Substituted when a write is absent or wrong-typed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Cell>,
}

impl CellSchema {
    pub fn new(kind: CellKind) -> Self {
        Self {
            kind,
            default: None,
        }
    }

    pub fn with_default(kind: CellKind, default: impl Into<Cell>) -> Self {
        Self {
            kind,
            default: Some(default.into()),
        }
    }
}

/// Declaration for a single value id.
pub type ValueSchema = CellSchema;

/// Per-table, per-cell declarations.
pub type TablesSchema = BTreeMap<Id, BTreeMap<Id, CellSchema>>;

/// Per-value declarations.
pub type ValuesSchema = BTreeMap<Id, ValueSchema>;

/// Outcome of validating one scalar write against a schema.
#[derive(Debug, PartialEq)]
pub enum Checked {
    /// No schema constraint applies; store the scalar as given.
    Accept,

    /// Scalar is wrong-typed or undeclared. The raw scalar must be reported
    /// invalid; `replacement` (the declared default, if any) may be stored in
    /// its place when the target slot is empty.
    Reject { replacement: Option<Cell> },
}

/// Check a cell write against the tables schema, if one is installed.
pub fn check_cell(
    schema: Option<&TablesSchema>,
    table_id: &str,
    cell_id: &str,
    cell: &Cell,
) -> Checked {
    match schema {
        None => Checked::Accept,
        Some(schema) => match schema.get(table_id).and_then(|t| t.get(cell_id)) {
            // Undeclared table or cell: rejected outright.
            None => Checked::Reject { replacement: None },
            Some(decl) if decl.kind == cell.kind() => Checked::Accept,
            Some(decl) => Checked::Reject {
                replacement: decl.default.clone(),
            },
        },
    }
}

/// Check a value write against the values schema, if one is installed.
pub fn check_value(schema: Option<&ValuesSchema>, value_id: &str, value: &Value) -> Checked {
    match schema {
        None => Checked::Accept,
        Some(schema) => match schema.get(value_id) {
            None => Checked::Reject { replacement: None },
            Some(decl) if decl.kind == value.kind() => Checked::Accept,
            Some(decl) => Checked::Reject {
                replacement: decl.default.clone(),
            },
        },
    }
}

/// Declared defaults for a table, used to fill absent cells in every row.
pub fn table_defaults<'a>(
    schema: Option<&'a TablesSchema>,
    table_id: &str,
) -> Vec<(&'a Id, &'a Cell)> {
    match schema.and_then(|s| s.get(table_id)) {
        None => Vec::new(),
        Some(cells) => cells
            .iter()
            .filter_map(|(cell_id, decl)| decl.default.as_ref().map(|d| (cell_id, d)))
            .collect(),
    }
}
