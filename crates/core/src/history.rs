//! Edit history.
//!
//! The save engine only needs a narrow view of the undo stack, expressed by
//! the [`History`] trait: read the current and base graphs, mark a
//! checkpoint, roll back to it, and apply or replace the latest action.
//! [`EditHistory`] is an in-memory implementation.

use std::fmt;

use tracing::{debug, warn};

use crate::difference::{difference, Difference};
use crate::entity::{Entity, EntityId};
use crate::graph::Graph;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A graph transformation recorded in history.
pub trait Action: fmt::Debug + Send + Sync {
    /// Produce the graph that results from applying this action to `graph`.
    fn apply(&self, graph: &Graph) -> Graph;

    /// Short description shown in undo listings.
    fn annotation(&self) -> Option<String> {
        None
    }
}

/// The empty action; used to mark checkpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl Action for Noop {
    fn apply(&self, graph: &Graph) -> Graph {
        graph.clone()
    }
}

/// A single local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Insert or overwrite an entity.
    Replace(Entity),
    /// Delete an entity.
    Remove(EntityId),
}

/// A batch of local edits applied as one history step.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyEdits {
    pub annotation: String,
    pub edits: Vec<Edit>,
}

impl ApplyEdits {
    pub fn new(annotation: impl Into<String>, edits: Vec<Edit>) -> Self {
        Self {
            annotation: annotation.into(),
            edits,
        }
    }
}

impl Action for ApplyEdits {
    fn apply(&self, graph: &Graph) -> Graph {
        let mut next = graph.clone();
        for edit in &self.edits {
            match edit {
                Edit::Replace(entity) => next.replace(entity.clone()),
                Edit::Remove(id) => next.remove(id),
            }
        }
        next
    }

    fn annotation(&self) -> Option<String> {
        Some(self.annotation.clone())
    }
}

// ---------------------------------------------------------------------------
// History trait
// ---------------------------------------------------------------------------

/// The edit-history capabilities consumed by the save engine.
pub trait History: Send {
    /// The current (edited) graph.
    fn graph(&self) -> &Graph;

    /// The graph before any local edits.
    fn base(&self) -> &Graph;

    /// Structural difference between the base and the current graph.
    fn difference(&self) -> Difference {
        difference(self.base(), self.graph())
    }

    /// Apply `action` as a new history step. Returns the number of entities
    /// it rewrote.
    fn perform(&mut self, action: &dyn Action) -> usize;

    /// Apply `action` to the current graph and store the result in place of
    /// the latest history step. Returns the number of entities it rewrote
    /// relative to the graph it superseded.
    fn replace(&mut self, action: &dyn Action) -> usize;

    /// Mark the current state so it can be restored later.
    fn checkpoint(&mut self);

    /// Discard every step since the latest checkpoint, including the
    /// checkpoint itself. Returns `false` when no checkpoint is open.
    fn rollback_to_checkpoint(&mut self) -> bool;

    /// Discard all edits and return to the base graph.
    fn flush(&mut self);
}

// ---------------------------------------------------------------------------
// In-memory history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct HistoryEntry {
    graph: Graph,
    annotation: Option<String>,
}

/// Undo stack over a fixed base graph.
#[derive(Debug, Clone)]
pub struct EditHistory {
    base: Graph,
    /// `stack[0]` is always the base state.
    stack: Vec<HistoryEntry>,
    /// Stack indices of open checkpoints, innermost last.
    checkpoints: Vec<usize>,
}

impl EditHistory {
    pub fn new(base: Graph) -> Self {
        let root = HistoryEntry {
            graph: base.clone(),
            annotation: None,
        };
        Self {
            base,
            stack: vec![root],
            checkpoints: Vec::new(),
        }
    }

    /// Number of steps above the base state.
    pub fn len(&self) -> usize {
        self.stack.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a checkpoint is open.
    pub fn has_checkpoint(&self) -> bool {
        !self.checkpoints.is_empty()
    }

    /// Annotations of every step, oldest first; checkpoints have none.
    pub fn annotations(&self) -> Vec<Option<String>> {
        self.stack[1..].iter().map(|e| e.annotation.clone()).collect()
    }

    fn head(&self) -> &HistoryEntry {
        // the root entry is never popped
        &self.stack[self.stack.len() - 1]
    }
}

impl History for EditHistory {
    fn graph(&self) -> &Graph {
        &self.head().graph
    }

    fn base(&self) -> &Graph {
        &self.base
    }

    fn perform(&mut self, action: &dyn Action) -> usize {
        let previous = self.graph();
        let graph = action.apply(previous);
        let rewritten = graph.rewritten_since(previous);
        debug!(rewritten, annotation = ?action.annotation(), "history perform");
        self.stack.push(HistoryEntry {
            graph,
            annotation: action.annotation(),
        });
        rewritten
    }

    fn replace(&mut self, action: &dyn Action) -> usize {
        if self.stack.len() == 1 {
            // the base state is immutable; replacing it becomes a new step
            return self.perform(action);
        }
        let previous = self.graph();
        let graph = action.apply(previous);
        let rewritten = graph.rewritten_since(previous);
        debug!(rewritten, annotation = ?action.annotation(), "history replace");

        let annotation = action
            .annotation()
            .or_else(|| self.head().annotation.clone());
        let last = self.stack.len() - 1;
        self.stack[last] = HistoryEntry { graph, annotation };
        rewritten
    }

    fn checkpoint(&mut self) {
        self.perform(&Noop);
        self.checkpoints.push(self.stack.len() - 1);
        debug!(depth = self.checkpoints.len(), "history checkpoint");
    }

    fn rollback_to_checkpoint(&mut self) -> bool {
        match self.checkpoints.pop() {
            Some(index) => {
                self.stack.truncate(index.max(1));
                debug!(remaining = self.len(), "rolled back to checkpoint");
                true
            }
            None => {
                warn!("rollback requested without an open checkpoint");
                false
            }
        }
    }

    fn flush(&mut self) {
        self.stack.truncate(1);
        self.checkpoints.clear();
        debug!("history flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Location;

    fn history() -> EditHistory {
        EditHistory::new(Graph::new(vec![
            Entity::point("n1", Location::new(0.0, 0.0)).with_version(1),
            Entity::point("n2", Location::new(1.0, 1.0)).with_version(1),
        ]))
    }

    fn tag_n1(value: &str) -> ApplyEdits {
        ApplyEdits::new(
            format!("tag n1 {value}"),
            vec![Edit::Replace(
                Entity::point("n1", Location::new(0.0, 0.0))
                    .with_version(1)
                    .with_tag("name", value),
            )],
        )
    }

    #[test]
    fn test_perform_and_difference() {
        let mut h = history();
        assert!(h.difference().is_empty());
        assert_eq!(h.perform(&tag_n1("Foo")), 1);
        assert_eq!(h.len(), 1);
        assert_eq!(h.difference().len(), 1);
        assert_eq!(h.graph().entity(&"n1".into()).unwrap().tag("name"), Some("Foo"));
    }

    #[test]
    fn test_replace_rewrites_latest_step() {
        let mut h = history();
        h.perform(&tag_n1("Foo"));
        h.replace(&tag_n1("Bar"));
        assert_eq!(h.len(), 1);
        assert_eq!(h.graph().entity(&"n1".into()).unwrap().tag("name"), Some("Bar"));
        assert_eq!(h.annotations(), vec![Some("tag n1 Bar".to_string())]);
    }

    #[test]
    fn test_replace_on_empty_history_pushes() {
        let mut h = history();
        h.replace(&tag_n1("Foo"));
        assert_eq!(h.len(), 1);
        assert!(h.base().entity(&"n1".into()).unwrap().tag("name").is_none());
    }

    #[test]
    fn test_checkpoint_rollback_discards_replacements() {
        let mut h = history();
        h.perform(&tag_n1("Foo"));
        h.checkpoint();
        assert!(h.has_checkpoint());
        assert_eq!(h.replace(&Noop), 0);
        h.replace(&ApplyEdits::new("drop n2", vec![Edit::Remove("n2".into())]));
        h.perform(&tag_n1("Baz"));
        assert_eq!(h.len(), 3);

        assert!(h.rollback_to_checkpoint());
        assert_eq!(h.len(), 1);
        assert!(h.graph().has_entity(&"n2".into()).is_some());
        assert_eq!(h.graph().entity(&"n1".into()).unwrap().tag("name"), Some("Foo"));
        assert!(!h.rollback_to_checkpoint());
    }

    #[test]
    fn test_flush() {
        let mut h = history();
        h.perform(&tag_n1("Foo"));
        h.checkpoint();
        h.flush();
        assert!(h.is_empty());
        assert!(!h.has_checkpoint());
        assert!(h.difference().is_empty());
    }
}
