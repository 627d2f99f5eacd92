//! Layered path trie for wildcard listener patterns.
//!
//! Each level holds a map of concrete-id children plus a single wildcard
//! bucket. Matching a coordinate walks at most two branches per level, so
//! lookup cost scales with pattern depth, not listener count.

use super::ListenerId;
use crate::types::Id;
use std::collections::HashMap;

#[derive(Default)]
struct Node {
    /// Listeners whose pattern ends at this node.
    ids: Vec<ListenerId>,
    concrete: HashMap<Id, Node>,
    wildcard: Option<Box<Node>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.concrete.is_empty() && self.wildcard.is_none()
    }
}

/// Trie of id-or-wildcard patterns for one listener kind.
#[derive(Default)]
pub struct PathTrie {
    root: Node,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` under `pattern`. `None` components are wildcards.
    pub fn add(&mut self, pattern: &[Option<Id>], id: ListenerId) {
        let mut node = &mut self.root;
        for component in pattern {
            node = match component {
                Some(concrete) => node.concrete.entry(concrete.clone()).or_default(),
                None => node.wildcard.get_or_insert_with(Default::default),
            };
        }
        node.ids.push(id);
    }

    /// Remove `id` from `pattern`, pruning emptied branches.
    pub fn remove(&mut self, pattern: &[Option<Id>], id: ListenerId) {
        Self::remove_at(&mut self.root, pattern, id);
    }

    fn remove_at(node: &mut Node, pattern: &[Option<Id>], id: ListenerId) {
        match pattern.split_first() {
            None => node.ids.retain(|other| *other != id),
            Some((Some(concrete), rest)) => {
                if let Some(child) = node.concrete.get_mut(concrete) {
                    Self::remove_at(child, rest, id);
                    if child.is_empty() {
                        node.concrete.remove(concrete);
                    }
                }
            }
            Some((None, rest)) => {
                if let Some(child) = node.wildcard.as_deref_mut() {
                    Self::remove_at(child, rest, id);
                    if child.is_empty() {
                        node.wildcard = None;
                    }
                }
            }
        }
    }

    /// Collect every listener whose pattern matches `coord`, in registration
    /// order within each node, wildcard branch after the concrete branch.
    pub fn matches(&self, coord: &[&str]) -> Vec<ListenerId> {
        let mut out = Vec::new();
        Self::collect(&self.root, coord, &mut out);
        out
    }

    fn collect(node: &Node, coord: &[&str], out: &mut Vec<ListenerId>) {
        match coord.split_first() {
            None => out.extend(node.ids.iter().copied()),
            Some((head, rest)) => {
                if let Some(child) = node.concrete.get(*head) {
                    Self::collect(child, rest, out);
                }
                if let Some(child) = node.wildcard.as_deref() {
                    Self::collect(child, rest, out);
                }
            }
        }
    }

    /// Whether any listener is registered at all.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
