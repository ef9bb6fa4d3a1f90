//! Graph snapshots.
//!
//! A [`Graph`] is an overlay of entity overrides on top of a shared,
//! immutable base snapshot. Deriving a new snapshot from an existing one
//! clones only the overlay; the base is shared through an `Arc`, so the
//! local and remote snapshots of one save attempt never deep-copy the base.
//! Edits insert into the overlay and never touch the base.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::entity::{Entity, EntityId};
use crate::errors::GraphError;

type Snapshot = HashMap<EntityId, Arc<Entity>>;

/// A point-in-time view of all entities.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    base: Arc<Snapshot>,
    /// `None` marks an entity removed relative to the base.
    overlay: HashMap<EntityId, Option<Arc<Entity>>>,
}

impl Graph {
    /// Build a base snapshot from a set of entities.
    pub fn new(entities: impl IntoIterator<Item = Entity>) -> Self {
        let base = entities
            .into_iter()
            .map(|e| (e.id.clone(), Arc::new(e)))
            .collect();
        Self {
            base: Arc::new(base),
            overlay: HashMap::new(),
        }
    }

    /// A shallow snapshot seeded from the same base as `other`, without any
    /// of `other`'s overrides.
    pub fn from_base(other: &Graph) -> Self {
        Self {
            base: Arc::clone(&other.base),
            overlay: HashMap::new(),
        }
    }

    /// Whether both snapshots derive from the same base.
    pub fn shares_base(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.base, &other.base)
    }

    /// Look up an entity, returning `None` when absent or removed.
    pub fn has_entity(&self, id: &EntityId) -> Option<&Entity> {
        self.revision(id).map(Arc::as_ref)
    }

    /// Look up an entity that must exist.
    pub fn entity(&self, id: &EntityId) -> Result<&Entity, GraphError> {
        self.has_entity(id)
            .ok_or_else(|| GraphError::EntityNotFound(id.clone()))
    }

    /// The entity as it exists in the base snapshot, ignoring overrides.
    pub fn base_entity(&self, id: &EntityId) -> Option<&Entity> {
        self.base.get(id).map(Arc::as_ref)
    }

    /// The stored revision of an entity. Two snapshots hold the same revision
    /// only if neither rewrote it since they diverged.
    pub(crate) fn revision(&self, id: &EntityId) -> Option<&Arc<Entity>> {
        match self.overlay.get(id) {
            Some(entry) => entry.as_ref(),
            None => self.base.get(id),
        }
    }

    /// Insert or overwrite an entity.
    pub fn replace(&mut self, entity: Entity) {
        self.overlay.insert(entity.id.clone(), Some(Arc::new(entity)));
    }

    /// Remove an entity from this snapshot.
    pub fn remove(&mut self, id: &EntityId) {
        self.overlay.insert(id.clone(), None);
    }

    /// Ids overridden relative to the base (replaced or removed).
    pub fn overlay_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.overlay.keys()
    }

    /// All entities present in this snapshot, in no particular order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        let from_base = self
            .base
            .iter()
            .filter(|(id, _)| !self.overlay.contains_key(*id))
            .map(|(_, e)| e.as_ref());
        let from_overlay = self.overlay.values().filter_map(|e| e.as_deref());
        from_base.chain(from_overlay)
    }

    pub fn len(&self) -> usize {
        self.entities().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Child points of a line that exist in this snapshot.
    pub fn child_nodes<'a>(&'a self, line: &Entity) -> Vec<&'a Entity> {
        line.nodes.iter().filter_map(|id| self.has_entity(id)).collect()
    }

    /// Lines that traverse the point `id`.
    pub fn parent_lines(&self, id: &EntityId) -> Vec<&Entity> {
        self.entities()
            .filter(|e| e.is_line() && e.nodes.contains(id))
            .collect()
    }

    /// Relations that list `id` as a member.
    pub fn parent_relations(&self, id: &EntityId) -> Vec<&Entity> {
        self.entities()
            .filter(|e| e.members.iter().any(|m| &m.id == id))
            .collect()
    }

    /// Ids whose presence or stored revision may differ between the two
    /// snapshots. With a shared base only overlay keys can differ.
    pub(crate) fn candidate_ids<'a>(&'a self, other: &'a Graph) -> HashSet<&'a EntityId> {
        if self.shares_base(other) {
            self.overlay.keys().chain(other.overlay.keys()).collect()
        } else {
            self.entities()
                .map(|e| &e.id)
                .chain(other.entities().map(|e| &e.id))
                .chain(self.overlay.keys())
                .chain(other.overlay.keys())
                .collect()
        }
    }

    /// Number of entities written, created, or removed since `previous`,
    /// counting rewrites even when the new content is identical.
    pub fn rewritten_since(&self, previous: &Graph) -> usize {
        self.candidate_ids(previous)
            .into_iter()
            .filter(|id| match (previous.revision(id), self.revision(id)) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            })
            .count()
    }
}
