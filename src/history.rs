//! Local undo/redo log for item edits.
//!
//! Entries hold item ids, so an optimistic create acknowledged by the server
//! must rewrite them through [`History::remap`] in the same step that
//! rewrites items and edges.

use std::collections::VecDeque;

use crate::model::{DashboardEdge, DashboardItem, ItemPatch};

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Created {
        item: DashboardItem,
    },
    Updated {
        item_id: String,
        before: ItemPatch,
        after: ItemPatch,
    },
    Deleted {
        item: DashboardItem,
        edges: Vec<DashboardEdge>,
    },
}

impl Change {
    fn remap(&mut self, from: &str, to: &str) {
        match self {
            Change::Created { item } => remap_id(&mut item.id, from, to),
            Change::Updated { item_id, .. } => remap_id(item_id, from, to),
            Change::Deleted { item, edges } => {
                remap_id(&mut item.id, from, to);
                for edge in edges {
                    remap_id(&mut edge.source_item_id, from, to);
                    remap_id(&mut edge.target_item_id, from, to);
                }
            }
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            Change::Created { item } | Change::Deleted { item, .. } => &item.id,
            Change::Updated { item_id, .. } => item_id,
        }
    }
}

fn remap_id(id: &mut String, from: &str, to: &str) {
    if id == from {
        *id = to.to_string();
    }
}

#[derive(Debug, Clone)]
pub struct History {
    /// Oldest entry at the front; evicted first once `limit` is reached.
    undo: VecDeque<Change>,
    redo: Vec<Change>,
    limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }
}

impl History {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Record a fresh local change.  Clears the redo stack.
    pub fn record(&mut self, change: Change) {
        self.redo.clear();
        self.push_undo(change);
    }

    pub fn take_undo(&mut self) -> Option<Change> {
        self.undo.pop_back()
    }

    pub fn take_redo(&mut self) -> Option<Change> {
        self.redo.pop()
    }

    pub fn push_redo(&mut self, change: Change) {
        self.redo.push(change);
    }

    /// Push onto the undo stack without touching redo (used when redoing).
    pub fn push_undo(&mut self, change: Change) {
        self.undo.push_back(change);
        while self.undo.len() > self.limit {
            self.undo.pop_front();
        }
    }

    pub fn remap(&mut self, from: &str, to: &str) {
        for change in self.undo.iter_mut().chain(self.redo.iter_mut()) {
            change.remap(from, to);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemType, Position, Size};

    fn item(id: &str) -> DashboardItem {
        DashboardItem {
            id: id.to_string(),
            item_type: ItemType::Note,
            content: String::new(),
            position: Position::default(),
            size: Size::default(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn record_clears_redo() {
        let mut history = History::default();
        history.record(Change::Created { item: item("a") });
        let change = history.take_undo().unwrap();
        history.push_redo(change);
        assert!(history.can_redo());
        history.record(Change::Created { item: item("b") });
        assert!(!history.can_redo());
    }

    #[test]
    fn limit_drops_oldest() {
        let mut history = History::with_limit(2);
        for id in ["a", "b", "c"] {
            history.record(Change::Created { item: item(id) });
        }
        assert_eq!(history.take_undo().unwrap().item_id(), "c");
        assert_eq!(history.take_undo().unwrap().item_id(), "b");
        assert!(history.take_undo().is_none());
    }

    #[test]
    fn redo_reentry_respects_limit() {
        let mut history = History::with_limit(2);
        for id in ["a", "b"] {
            history.record(Change::Created { item: item(id) });
        }
        history.push_redo(Change::Created { item: item("r") });
        let change = history.take_redo().unwrap();
        history.push_undo(change);
        assert_eq!(history.take_undo().unwrap().item_id(), "r");
        assert_eq!(history.take_undo().unwrap().item_id(), "b");
        assert!(!history.can_undo());
    }

    #[test]
    fn remap_rewrites_every_reference() {
        let mut history = History::default();
        history.record(Change::Created { item: item("tmp-1") });
        history.record(Change::Updated {
            item_id: "tmp-1".into(),
            before: ItemPatch::default(),
            after: ItemPatch::default(),
        });
        history.record(Change::Deleted {
            item: item("other"),
            edges: vec![DashboardEdge {
                id: "e1".into(),
                source_item_id: "other".into(),
                target_item_id: "tmp-1".into(),
                source_handle: None,
                target_handle: None,
            }],
        });
        let redo = history.take_undo().unwrap();
        history.push_redo(redo);

        history.remap("tmp-1", "srv-1");

        match history.take_redo().unwrap() {
            Change::Deleted { edges, .. } => assert_eq!(edges[0].target_item_id, "srv-1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(history.take_undo().unwrap().item_id(), "srv-1");
        assert_eq!(history.take_undo().unwrap().item_id(), "srv-1");
    }
}
