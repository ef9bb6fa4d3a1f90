//! Three-way merge of a single entity against its remote copy.
//!
//! [`MergeRemoteChanges`] is a history [`Action`]: applied to the current
//! graph it merges the local and remote versions of one entity (and, for
//! lines, its child points) using the base snapshot as the common ancestor.
//! Disjoint changes are combined and the result carries the remote version.
//! Overlapping changes leave the graph untouched and are reported as
//! human-readable conflict strings. The forced variants resolve every
//! overlap in favour of one side.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entity::{Entity, EntityId, EntityKind, Location};
use crate::errors::ConflictError;
use crate::graph::Graph;
use crate::history::Action;

/// Renders a remote user name for conflict messages (e.g. as a profile link).
pub type UserFormatter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Which side wins overlapping changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeOption {
    /// Combine disjoint changes; report overlaps as conflicts.
    #[default]
    Safe,
    /// Keep the local version of every overlapping field.
    ForceLocal,
    /// Accept the remote version of every overlapping field.
    ForceRemote,
}

impl fmt::Display for MergeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::ForceLocal => write!(f, "force_local"),
            Self::ForceRemote => write!(f, "force_remote"),
        }
    }
}

/// The graph produced by a merge and the conflicts it found.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub graph: Graph,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Default)]
struct ChildUpdates {
    replacements: Vec<Entity>,
    remove_ids: Vec<EntityId>,
}

/// Merge action for one entity.
#[derive(Clone)]
pub struct MergeRemoteChanges {
    id: EntityId,
    local: Arc<Graph>,
    remote: Arc<Graph>,
    option: MergeOption,
    formatter: Option<UserFormatter>,
}

impl fmt::Debug for MergeRemoteChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRemoteChanges")
            .field("id", &self.id)
            .field("option", &self.option)
            .finish_non_exhaustive()
    }
}

impl MergeRemoteChanges {
    pub fn new(id: EntityId, local: Arc<Graph>, remote: Arc<Graph>) -> Self {
        Self {
            id,
            local,
            remote,
            option: MergeOption::Safe,
            formatter: None,
        }
    }

    pub fn with_option(mut self, option: MergeOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_user_formatter(mut self, formatter: Option<UserFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn option(&self) -> MergeOption {
        self.option
    }

    /// Run the merge against `graph` without touching history.
    pub fn evaluate(&self, graph: &Graph) -> Result<MergeOutcome, ConflictError> {
        let local = self.local.entity(&self.id)?;
        let remote = self.remote.entity(&self.id)?;
        let base = graph.base_entity(&self.id);
        let current = graph.has_entity(&self.id);

        // already brought up to date by the merge of a parent line
        if self.option == MergeOption::Safe && local.version != remote.version {
            if let Some(current) = current.filter(|c| c.version == remote.version) {
                let mut next = graph.clone();
                next.replace(current.clone());
                return Ok(MergeOutcome {
                    graph: next,
                    conflicts: Vec::new(),
                });
            }
        }

        let mut target = current.unwrap_or(local).clone();
        target.version = remote.version;

        let mut conflicts = Vec::new();
        let mut updates = ChildUpdates::default();
        let mut next = graph.clone();

        if !remote.visible {
            match self.option {
                MergeOption::ForceRemote => {
                    delete_entity(&mut next, &self.id);
                    return Ok(MergeOutcome {
                        graph: next,
                        conflicts,
                    });
                }
                MergeOption::ForceLocal => {
                    if target.is_line() {
                        let children = unique(&local.nodes);
                        self.merge_children(&target, &children, &mut updates, graph, &mut conflicts);
                        apply_child_updates(&mut next, updates);
                    }
                    next.replace(target);
                    return Ok(MergeOutcome {
                        graph: next,
                        conflicts,
                    });
                }
                MergeOption::Safe => {
                    conflicts.push(format!(
                        "This object has been deleted by {}.",
                        self.user(remote)
                    ));
                    return Ok(MergeOutcome {
                        graph: graph.clone(),
                        conflicts,
                    });
                }
            }
        }

        match target.kind {
            EntityKind::Point => {
                target = self.merge_location(base, remote, target, &mut conflicts);
            }
            EntityKind::Line => {
                for child in self.remote.child_nodes(remote) {
                    if next.has_entity(&child.id).is_none() {
                        next.replace(child.clone());
                    }
                }
                target = self.merge_nodes(base, remote, target, &mut conflicts);
                let children = union(&local.nodes, &remote.nodes);
                self.merge_children(&target, &children, &mut updates, &next, &mut conflicts);
            }
            EntityKind::Relation => {
                target = self.merge_members(base, remote, target, &mut conflicts);
            }
        }

        target = self.merge_tags(base, remote, target, &mut conflicts);

        if !conflicts.is_empty() {
            debug!(id = %self.id, count = conflicts.len(), "merge found conflicts");
            return Ok(MergeOutcome {
                graph: graph.clone(),
                conflicts,
            });
        }

        apply_child_updates(&mut next, updates);
        next.replace(target);
        debug!(id = %self.id, option = %self.option, "merge applied");
        Ok(MergeOutcome {
            graph: next,
            conflicts,
        })
    }

    fn user(&self, remote: &Entity) -> String {
        match (&remote.user, &self.formatter) {
            (Some(user), Some(format)) => format(user),
            (Some(user), None) => user.clone(),
            (None, _) => "another user".to_string(),
        }
    }

    fn merge_location(
        &self,
        base: Option<&Entity>,
        remote: &Entity,
        mut target: Entity,
        conflicts: &mut Vec<String>,
    ) -> Entity {
        if self.option == MergeOption::ForceLocal || same_location(target.loc, remote.loc) {
            return target;
        }
        if self.option == MergeOption::ForceRemote {
            target.loc = remote.loc;
            return target;
        }
        if let Some(base) = base {
            if same_location(base.loc, remote.loc) {
                return target;
            }
            if same_location(base.loc, target.loc) {
                target.loc = remote.loc;
                return target;
            }
        }
        conflicts.push(format!(
            "This object was moved by both you and {}.",
            self.user(remote)
        ));
        target
    }

    fn merge_nodes(
        &self,
        base: Option<&Entity>,
        remote: &Entity,
        mut target: Entity,
        conflicts: &mut Vec<String>,
    ) -> Entity {
        if self.option == MergeOption::ForceLocal || target.nodes == remote.nodes {
            return target;
        }
        if self.option == MergeOption::ForceRemote {
            target.nodes = remote.nodes.clone();
            return target;
        }

        let ancestor = base.map(|b| b.nodes.as_slice()).unwrap_or_default();
        match merge_node_lists(ancestor, &target.nodes, &remote.nodes) {
            Ok(nodes) => target.nodes = nodes,
            Err(err) => {
                debug!(id = %self.id, error = %err, "node list merge failed");
                conflicts.push(format!(
                    "Nodes were changed by both you and {}.",
                    self.user(remote)
                ));
            }
        }
        target
    }

    /// Reconcile the child points of `target_line`: drop children no longer
    /// referenced and unused elsewhere, and merge the ones that remain.
    fn merge_children(
        &self,
        target_line: &Entity,
        children: &[EntityId],
        updates: &mut ChildUpdates,
        graph: &Graph,
        conflicts: &mut Vec<String>,
    ) {
        let before = conflicts.len();

        for id in children {
            if !target_line.nodes.contains(id) {
                if let Some(node) = graph.has_entity(id) {
                    if !is_used(node, target_line, graph) {
                        updates.remove_ids.push(id.clone());
                    }
                }
                continue;
            }

            let local = self.local.has_entity(id);
            let remote = self.remote.has_entity(id);

            if self.option == MergeOption::ForceRemote && remote.is_some_and(|r| r.visible) {
                if let Some(remote) = remote {
                    updates.replacements.push(remote.clone());
                }
            } else if self.option == MergeOption::ForceLocal && local.is_some() {
                if let Some(local) = local {
                    let mut child = local.clone();
                    if let Some(remote) = remote {
                        child.version = remote.version;
                    }
                    updates.replacements.push(child);
                }
            } else if self.option == MergeOption::Safe {
                // start from the current graph so earlier merges are kept
                let current = graph.has_entity(id).or(local);
                if let (Some(current), Some(remote)) = (current, remote) {
                    if current.version == remote.version {
                        continue;
                    }
                    let mut child = current.clone();
                    child.version = remote.version;
                    if remote.visible {
                        let base = graph.base_entity(id);
                        child = self.merge_location(base, remote, child, conflicts);
                        child = self.merge_tags(base, remote, child, conflicts);
                    } else {
                        conflicts.push(format!(
                            "This object has been deleted by {}.",
                            self.user(remote)
                        ));
                    }
                    if conflicts.len() != before {
                        break;
                    }
                    updates.replacements.push(child);
                }
            }
        }
    }

    fn merge_members(
        &self,
        base: Option<&Entity>,
        remote: &Entity,
        mut target: Entity,
        conflicts: &mut Vec<String>,
    ) -> Entity {
        if self.option == MergeOption::ForceLocal || target.members == remote.members {
            return target;
        }
        if self.option == MergeOption::ForceRemote {
            target.members = remote.members.clone();
            return target;
        }
        if let Some(base) = base {
            if base.members == remote.members {
                return target;
            }
            if base.members == target.members {
                target.members = remote.members.clone();
                return target;
            }
        }
        conflicts.push(format!(
            "Relation members were changed by both you and {}.",
            self.user(remote)
        ));
        target
    }

    fn merge_tags(
        &self,
        base: Option<&Entity>,
        remote: &Entity,
        mut target: Entity,
        conflicts: &mut Vec<String>,
    ) -> Entity {
        if self.option == MergeOption::ForceLocal || target.tags == remote.tags {
            return target;
        }
        if self.option == MergeOption::ForceRemote {
            target.tags = remote.tags.clone();
            return target;
        }

        let empty = BTreeMap::new();
        let ancestor = base.map(|b| &b.tags).unwrap_or(&empty);
        let ours = &target.tags;
        let theirs = &remote.tags;

        let keys: BTreeSet<&String> = ancestor.keys().chain(ours.keys()).chain(theirs.keys()).collect();
        let before = conflicts.len();
        let mut tags = ours.clone();
        let mut changed = false;

        for key in keys {
            let (o, a, b) = (ancestor.get(key), ours.get(key), theirs.get(key));
            if o == b || a == b {
                continue;
            }
            if o != a {
                conflicts.push(format!(
                    "You changed the \"{}\" tag to \"{}\" and {} changed it to \"{}\".",
                    key,
                    a.map(String::as_str).unwrap_or("(removed)"),
                    self.user(remote),
                    b.map(String::as_str).unwrap_or("(removed)"),
                ));
            } else {
                match b {
                    Some(value) => tags.insert(key.clone(), value.clone()),
                    None => tags.remove(key),
                };
                changed = true;
            }
        }

        if changed && conflicts.len() == before {
            target.tags = tags;
        }
        target
    }
}

impl Action for MergeRemoteChanges {
    fn apply(&self, graph: &Graph) -> Graph {
        match self.evaluate(graph) {
            Ok(outcome) => outcome.graph,
            Err(err) => {
                warn!(id = %self.id, error = %err, "merge could not be evaluated");
                graph.clone()
            }
        }
    }

    fn annotation(&self) -> Option<String> {
        Some(match self.option {
            MergeOption::Safe => format!("Merged remote changes to {}", self.id),
            MergeOption::ForceLocal => format!("Kept local version of {}", self.id),
            MergeOption::ForceRemote => format!("Accepted remote version of {}", self.id),
        })
    }
}

// ---------------------------------------------------------------------------
// Node list merge
// ---------------------------------------------------------------------------

/// Three-way merge of ordered id lists.
///
/// One id per line is fed to `diffy`, so the merge is hunk-based: edits to
/// separate stretches of the list combine, edits to the same stretch fail.
pub fn merge_node_lists(
    base: &[EntityId],
    ours: &[EntityId],
    theirs: &[EntityId],
) -> Result<Vec<EntityId>, ConflictError> {
    if ours == theirs || theirs == base {
        return Ok(ours.to_vec());
    }
    if ours == base {
        return Ok(theirs.to_vec());
    }

    let to_lines = |ids: &[EntityId]| -> String { ids.iter().map(|id| format!("{id}\n")).collect() };
    diffy::merge(&to_lines(base), &to_lines(ours), &to_lines(theirs))
        .map(|merged| merged.lines().map(EntityId::from).collect())
        .map_err(|_| ConflictError::NodeListMerge("overlapping edits to the node list".into()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn same_location(a: Option<Location>, b: Option<Location>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.approx_eq(&b),
        (None, None) => true,
        _ => false,
    }
}

fn unique(ids: &[EntityId]) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(*id)).cloned().collect()
}

fn union(a: &[EntityId], b: &[EntityId]) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    a.iter().chain(b).filter(|id| seen.insert(*id)).cloned().collect()
}

/// A point is still needed if another line or a relation references it, or
/// if it carries meaningful tags of its own.
fn is_used(node: &Entity, target_line: &Entity, graph: &Graph) -> bool {
    node.has_interesting_tags()
        || graph
            .parent_lines(&node.id)
            .iter()
            .any(|line| line.id != target_line.id)
        || !graph.parent_relations(&node.id).is_empty()
}

fn apply_child_updates(graph: &mut Graph, updates: ChildUpdates) {
    for entity in updates.replacements {
        graph.replace(entity);
    }
    for id in &updates.remove_ids {
        graph.remove(id);
    }
}

/// Remove an entity along with its relation memberships. Deleting a line
/// also removes child points nothing else uses; deleting a point removes it
/// from the lines that traverse it.
fn delete_entity(graph: &mut Graph, id: &EntityId) {
    let relations: Vec<Entity> = graph.parent_relations(id).into_iter().cloned().collect();
    for mut relation in relations {
        relation.members.retain(|m| &m.id != id);
        graph.replace(relation);
    }

    let Some(entity) = graph.has_entity(id).cloned() else {
        return;
    };

    match entity.kind {
        EntityKind::Line => {
            for child in unique(&entity.nodes) {
                let orphan = graph.has_entity(&child).is_some_and(|node| {
                    !node.has_interesting_tags()
                        && graph.parent_lines(&child).iter().all(|l| l.id == entity.id)
                        && graph.parent_relations(&child).is_empty()
                });
                if orphan {
                    graph.remove(&child);
                }
            }
        }
        EntityKind::Point => {
            let lines: Vec<Entity> = graph.parent_lines(id).into_iter().cloned().collect();
            for mut line in lines {
                line.nodes.retain(|n| n != id);
                graph.replace(line);
            }
        }
        EntityKind::Relation => {}
    }

    graph.remove(id);
}
