//! Difference engine.
//!
//! Computes the entities changed between two graph snapshots, classified as
//! created / modified / deleted, and derives the outgoing [`ChangeSet`].
//! Everything here is a pure function of its inputs.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId};
use crate::errors::GraphError;
use crate::graph::Graph;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How an entity changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single changed entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: EntityId,
    pub kind: ChangeKind,
    /// The entity in the base snapshot (absent for `Created`).
    pub base: Option<Arc<Entity>>,
    /// The entity in the candidate snapshot (absent for `Deleted`).
    pub head: Option<Arc<Entity>>,
}

/// Ordered set of changes between two snapshots, sorted by entity id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Difference {
    changes: Vec<Change>,
}

impl Difference {
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Ids of every change of the given kind, in difference order.
    pub fn ids_of(&self, kind: ChangeKind) -> Vec<EntityId> {
        self.changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Number of changes of the given kind.
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// Build the outgoing change set: created and modified entities carry
    /// their new state, deleted entities their base state.
    pub fn to_change_set(&self) -> ChangeSet {
        let mut set = ChangeSet::default();
        for change in &self.changes {
            match (change.kind, &change.head, &change.base) {
                (ChangeKind::Created, Some(head), _) => set.created.push(Entity::clone(head)),
                (ChangeKind::Modified, Some(head), _) => set.modified.push(Entity::clone(head)),
                (ChangeKind::Deleted, _, Some(base)) => set.deleted.push(Entity::clone(base)),
                _ => {}
            }
        }
        set
    }
}

/// The entity payload submitted as one atomic changeset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub created: Vec<Entity>,
    #[serde(default)]
    pub modified: Vec<Entity>,
    #[serde(default)]
    pub deleted: Vec<Entity>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Compute the changes that turn `base` into `head`.
///
/// An entity is `Modified` when present in both with differing content
/// (version included), `Created` when absent from `base`, and `Deleted` when
/// absent from `head`.
pub fn difference(base: &Graph, head: &Graph) -> Difference {
    let mut ids: Vec<&EntityId> = base.candidate_ids(head).into_iter().collect();
    ids.sort();

    let changes = ids
        .into_iter()
        .filter_map(|id| {
            let (kind, before, after) = match (base.revision(id), head.revision(id)) {
                (None, Some(h)) => (ChangeKind::Created, None, Some(h)),
                (Some(b), None) => (ChangeKind::Deleted, Some(b), None),
                (Some(b), Some(h)) if b != h => (ChangeKind::Modified, Some(b), Some(h)),
                _ => return None,
            };
            Some(Change {
                id: id.clone(),
                kind,
                base: before.cloned(),
                head: after.cloned(),
            })
        })
        .collect();

    Difference { changes }
}

/// Drop tag mutations whose key matches `is_noise` from created and modified
/// entities. Structural changes are kept; a modification that consisted only
/// of noise tags disappears from the result.
pub fn discard_tags<F>(diff: &Difference, is_noise: F) -> Difference
where
    F: Fn(&str) -> bool,
{
    let changes = diff
        .changes
        .iter()
        .filter_map(|change| {
            let head = match (&change.kind, &change.head) {
                (ChangeKind::Deleted, _) | (_, None) => return Some(change.clone()),
                (_, Some(head)) => head,
            };
            if !head.tags.keys().any(|k| is_noise(k)) {
                return Some(change.clone());
            }

            let mut cleaned = Entity::clone(head);
            cleaned.tags.retain(|k, _| !is_noise(k));

            if change.kind == ChangeKind::Modified
                && change.base.as_deref() == Some(&cleaned)
            {
                return None;
            }
            Some(Change {
                head: Some(Arc::new(cleaned)),
                ..change.clone()
            })
        })
        .collect();

    Difference { changes }
}

/// Expand `ids` with the child points of every line among them.
///
/// The result keeps first-encounter order and has no duplicates; applying
/// it twice yields the same set. Every id must exist in `graph`.
pub fn with_children(ids: &[EntityId], graph: &Graph) -> Result<Vec<EntityId>, GraphError> {
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(ids.len());

    for id in ids {
        if seen.insert(id.clone()) {
            result.push(id.clone());
        }
        let entity = graph.entity(id)?;
        if entity.is_line() {
            for child in &entity.nodes {
                if seen.insert(child.clone()) {
                    result.push(child.clone());
                }
            }
        }
    }

    Ok(result)
}
