//! Listener registration and path-pattern matching.
//!
//! Listeners subscribe to a structural level of the store (Tables, a single
//! Table, a Row, a Cell, Values, a Value, or the invalid-write channels) with
//! a pattern of concrete ids and wildcards. The registry keeps one layered
//! path trie per listener kind so that settle-time matching walks touched
//! coordinates rather than scanning every listener.

mod path;
mod registry;

pub use path::PathTrie;
pub use registry::IdPool;
pub(crate) use registry::{ListenerEntry, Registry};

use crate::store::Store;
use crate::types::{Cell, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Handle to a registered listener, drawn from a recycling pool.
///
/// The smallest free id is always reused first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u32);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The structural level a listener is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Tables,
    TableIds,
    Table,
    RowIds,
    Row,
    CellIds,
    Cell,
    Values,
    ValueIds,
    Value,
    InvalidCell,
    InvalidValue,
}

impl ListenerKind {
    /// Pattern depth for this kind (number of id components).
    pub fn depth(self) -> usize {
        match self {
            ListenerKind::Tables
            | ListenerKind::TableIds
            | ListenerKind::Values
            | ListenerKind::ValueIds => 0,
            ListenerKind::Table | ListenerKind::RowIds | ListenerKind::Value => 1,
            ListenerKind::InvalidValue => 1,
            ListenerKind::Row | ListenerKind::CellIds => 2,
            ListenerKind::Cell | ListenerKind::InvalidCell => 3,
        }
    }
}

/// Per-kind count of live listeners.
///
/// Populated only in debug builds; all counts stay zero in release builds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub tables: u32,
    pub table_ids: u32,
    pub table: u32,
    pub row_ids: u32,
    pub row: u32,
    pub cell_ids: u32,
    pub cell: u32,
    pub values: u32,
    pub value_ids: u32,
    pub value: u32,
    pub invalid_cell: u32,
    pub invalid_value: u32,
}

impl ListenerStats {
    /// Total live listeners across all kinds.
    pub fn total(&self) -> u32 {
        self.tables
            + self.table_ids
            + self.table
            + self.row_ids
            + self.row
            + self.cell_ids
            + self.cell
            + self.values
            + self.value_ids
            + self.value
            + self.invalid_cell
            + self.invalid_value
    }
}

/// Shared, re-entrant callback slot.
pub(crate) type Shared<T> = Rc<RefCell<T>>;

pub(crate) type TablesCallback = Shared<dyn FnMut(&Store)>;
pub(crate) type TableIdsCallback = Shared<dyn FnMut(&Store)>;
pub(crate) type TableCallback = Shared<dyn FnMut(&Store, &str)>;
pub(crate) type RowIdsCallback = Shared<dyn FnMut(&Store, &str)>;
pub(crate) type RowCallback = Shared<dyn FnMut(&Store, &str, &str)>;
pub(crate) type CellIdsCallback = Shared<dyn FnMut(&Store, &str, &str)>;
pub(crate) type CellCallback =
    Shared<dyn FnMut(&Store, &str, &str, &str, Option<&Cell>, Option<&Cell>)>;
pub(crate) type ValuesCallback = Shared<dyn FnMut(&Store)>;
pub(crate) type ValueIdsCallback = Shared<dyn FnMut(&Store)>;
pub(crate) type ValueCallback = Shared<dyn FnMut(&Store, &str, Option<&Value>, Option<&Value>)>;
pub(crate) type InvalidCellCallback = Shared<dyn FnMut(&Store, &str, &str, &str, &[Cell])>;
pub(crate) type InvalidValueCallback = Shared<dyn FnMut(&Store, &str, &[Value])>;

/// The callback held by a listener, tagged by kind.
#[derive(Clone)]
pub(crate) enum Callback {
    Tables(TablesCallback),
    TableIds(TableIdsCallback),
    Table(TableCallback),
    RowIds(RowIdsCallback),
    Row(RowCallback),
    CellIds(CellIdsCallback),
    Cell(CellCallback),
    Values(ValuesCallback),
    ValueIds(ValueIdsCallback),
    Value(ValueCallback),
    InvalidCell(InvalidCellCallback),
    InvalidValue(InvalidValueCallback),
}

impl Callback {
    pub(crate) fn kind(&self) -> ListenerKind {
        match self {
            Callback::Tables(_) => ListenerKind::Tables,
            Callback::TableIds(_) => ListenerKind::TableIds,
            Callback::Table(_) => ListenerKind::Table,
            Callback::RowIds(_) => ListenerKind::RowIds,
            Callback::Row(_) => ListenerKind::Row,
            Callback::CellIds(_) => ListenerKind::CellIds,
            Callback::Cell(_) => ListenerKind::Cell,
            Callback::Values(_) => ListenerKind::Values,
            Callback::ValueIds(_) => ListenerKind::ValueIds,
            Callback::Value(_) => ListenerKind::Value,
            Callback::InvalidCell(_) => ListenerKind::InvalidCell,
            Callback::InvalidValue(_) => ListenerKind::InvalidValue,
        }
    }
}
