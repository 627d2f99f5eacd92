//! Core types for the tabular store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier for tables, rows, cells and values.
pub type Id = String;

/// A scalar stored in a Cell or Value slot.
///
/// Exactly one of boolean, number or string. Numbers are f64, matching the
/// JSON data model used by [`crate::Store::get_json`].
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Cell {
    /// The kind of scalar this cell holds.
    pub fn kind(&self) -> CellKind {
        match self {
            Cell::Bool(_) => CellKind::Bool,
            Cell::Number(_) => CellKind::Number,
            Cell::String(_) => CellKind::String,
        }
    }

    /// Numeric payload, if this is a number cell.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if this is a string cell.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean payload, if this is a boolean cell.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Bool(b) => write!(f, "Cell({})", b),
            Cell::Number(n) => write!(f, "Cell({})", n),
            Cell::String(s) => write!(f, "Cell({:?})", s),
        }
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Bool(b)
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Number(n)
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Number(n as f64)
    }
}

impl From<i32> for Cell {
    fn from(n: i32) -> Self {
        Cell::Number(n as f64)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::String(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::String(s)
    }
}

/// A keyed scalar in the flat top-level map. Same scalar kinds as [`Cell`].
pub type Value = Cell;

/// The scalar kind a cell may hold, as declared in a schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Bool,
    Number,
    String,
}

/// One row: cell id to scalar.
pub type Row = BTreeMap<Id, Cell>;

/// One table: row id to row.
pub type Table = BTreeMap<Id, Row>;

/// The root table container: table id to table.
pub type Tables = BTreeMap<Id, Table>;

/// The flat value container: value id to scalar.
pub type Values = BTreeMap<Id, Value>;

/// Coordinate of a cell.
pub type CellCoord = (Id, Id, Id);

/// Coordinate of a row.
pub type RowCoord = (Id, Id);
