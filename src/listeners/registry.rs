//! Listener storage: pooled ids, per-kind path tries.

use super::{Callback, ListenerId, ListenerKind, ListenerStats, PathTrie};
use crate::types::Id;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Recycling non-negative id pool. The smallest free id is handed out first.
#[derive(Default)]
pub struct IdPool {
    next: u32,
    free: BinaryHeap<Reverse<u32>>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> ListenerId {
        match self.free.pop() {
            Some(Reverse(id)) => ListenerId(id),
            None => {
                let id = self.next;
                self.next += 1;
                ListenerId(id)
            }
        }
    }

    pub fn release(&mut self, id: ListenerId) {
        self.free.push(Reverse(id.0));
    }
}

/// A registered listener: callback, pattern, scheduling role.
pub(crate) struct ListenerEntry {
    pub callback: Callback,
    pub pattern: Vec<Option<Id>>,
    pub is_mutator: bool,
}

/// All live listeners for one store, indexed by id and by path pattern.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<ListenerId, ListenerEntry>,
    tries: HashMap<ListenerKind, PathTrie>,
    pool: IdPool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        callback: Callback,
        pattern: Vec<Option<Id>>,
        is_mutator: bool,
    ) -> ListenerId {
        debug_assert_eq!(pattern.len(), callback.kind().depth());
        let id = self.pool.acquire();
        let kind = callback.kind();
        self.tries.entry(kind).or_default().add(&pattern, id);
        self.entries.insert(
            id,
            ListenerEntry {
                callback,
                pattern,
                is_mutator,
            },
        );
        id
    }

    /// Remove a listener, releasing its id. Unknown ids are a no-op.
    pub fn remove(&mut self, id: ListenerId) {
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(trie) = self.tries.get_mut(&entry.callback.kind()) {
                trie.remove(&entry.pattern, id);
            }
            self.pool.release(id);
        }
    }

    pub fn get(&self, id: ListenerId) -> Option<&ListenerEntry> {
        self.entries.get(&id)
    }

    /// Ids of listeners of `kind` whose pattern matches `coord`.
    pub fn matches(&self, kind: ListenerKind, coord: &[&str]) -> Vec<ListenerId> {
        match self.tries.get(&kind) {
            Some(trie) => trie.matches(coord),
            None => Vec::new(),
        }
    }

    /// Per-kind live listener counts. Only populated in debug builds.
    pub fn stats(&self) -> ListenerStats {
        let mut stats = ListenerStats::default();
        if cfg!(debug_assertions) {
            for entry in self.entries.values() {
                let slot = match entry.callback.kind() {
                    ListenerKind::Tables => &mut stats.tables,
                    ListenerKind::TableIds => &mut stats.table_ids,
                    ListenerKind::Table => &mut stats.table,
                    ListenerKind::RowIds => &mut stats.row_ids,
                    ListenerKind::Row => &mut stats.row,
                    ListenerKind::CellIds => &mut stats.cell_ids,
                    ListenerKind::Cell => &mut stats.cell,
                    ListenerKind::Values => &mut stats.values,
                    ListenerKind::ValueIds => &mut stats.value_ids,
                    ListenerKind::Value => &mut stats.value,
                    ListenerKind::InvalidCell => &mut stats.invalid_cell,
                    ListenerKind::InvalidValue => &mut stats.invalid_value,
                };
                *slot += 1;
            }
        }
        stats
    }
}
