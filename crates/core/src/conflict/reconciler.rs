//! Version reconciliation.
//!
//! The [`VersionReconciler`] reloads the remote copies of every locally
//! modified entity (plus the child points of modified lines), compares
//! versions, and runs a speculative [`MergeRemoteChanges`] through history for
//! each entity that moved on the remote. Merges that rewrite nothing become
//! [`Conflict`]s.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::conflict::merger::{MergeRemoteChanges, UserFormatter};
use crate::conflict::resolver::{ChoiceKind, Conflict};
use crate::difference::{with_children, ChangeKind};
use crate::entity::{Entity, EntityId};
use crate::errors::{GraphError, SaveError};
use crate::graph::Graph;
use crate::history::History;
use crate::transport::EntityLoader;

/// Ids per reload request unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 150;

/// What one save attempt has to check and reload.
#[derive(Debug, Clone)]
pub struct ReloadPlan {
    /// The local graph at the start of reconciliation.
    pub local: Arc<Graph>,
    /// Modified entities; each one is compared and possibly merged.
    pub to_check: Vec<EntityId>,
    /// `to_check` plus the child points of every line in it, minus points
    /// created locally (the remote has never seen them).
    pub to_load: Vec<EntityId>,
}

impl ReloadPlan {
    pub fn from_history<H>(history: &H) -> Result<Self, GraphError>
    where
        H: History + ?Sized,
    {
        let local = Arc::new(history.graph().clone());
        let to_check = history.difference().ids_of(ChangeKind::Modified);
        let base = history.base();
        let to_load = with_children(&to_check, &local)?
            .into_iter()
            .filter(|id| base.has_entity(id).is_some())
            .collect();
        Ok(Self {
            local,
            to_check,
            to_load,
        })
    }
}

/// Result of comparing every checked entity.
#[derive(Debug, Default)]
pub struct ConflictCheck {
    /// Sorted by entity id, descending.
    pub conflicts: Vec<Conflict>,
    /// Entities merged automatically.
    pub merged: Vec<EntityId>,
    /// Entities whose versions already matched.
    pub unchanged: Vec<EntityId>,
}

/// Reloads remote entities and reconciles them against local edits.
pub struct VersionReconciler {
    loader: Arc<dyn EntityLoader>,
    chunk_size: usize,
    default_choice: ChoiceKind,
    formatter: Option<UserFormatter>,
}

impl VersionReconciler {
    pub fn new(loader: Arc<dyn EntityLoader>) -> Self {
        Self {
            loader,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_choice: ChoiceKind::default(),
            formatter: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_default_choice(mut self, choice: ChoiceKind) -> Self {
        self.default_choice = choice;
        self
    }

    pub fn with_user_formatter(mut self, formatter: Option<UserFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    // -----------------------------------------------------------------------
    // Reload
    // -----------------------------------------------------------------------

    /// Load every id in `to_load` into `remote`.
    ///
    /// Chunks are requested concurrently. This task is the only writer of
    /// `remote` and of the outstanding set, so the set is only tested for
    /// emptiness after every response has been merged. The first transport
    /// error aborts the remaining chunks.
    pub async fn reload(&self, to_load: &[EntityId], remote: &mut Graph) -> Result<(), SaveError> {
        let mut outstanding: HashSet<EntityId> = to_load.iter().cloned().collect();
        if outstanding.is_empty() {
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for (index, chunk) in to_load.chunks(self.chunk_size).enumerate() {
            let loader = Arc::clone(&self.loader);
            let ids = chunk.to_vec();
            tasks.spawn(async move { (index, loader.load_entities(&ids).await) });
        }
        info!(
            ids = outstanding.len(),
            chunks = tasks.len(),
            "reloading remote entities"
        );

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| SaveError::TaskFailed(e.to_string()))?;
            match result {
                Ok(entities) => {
                    for entity in entities {
                        outstanding.remove(&entity.id);
                        remote.replace(entity);
                    }
                    debug!(chunk = index, remaining = outstanding.len(), "reload chunk merged");
                }
                Err(err) => {
                    warn!(chunk = index, error = %err, "reload failed");
                    tasks.abort_all();
                    return Err(SaveError::Transport(err));
                }
            }
        }

        if !outstanding.is_empty() {
            let mut missing: Vec<EntityId> = outstanding.into_iter().collect();
            missing.sort();
            warn!(missing = missing.len(), "reload finished with entities missing");
            return Err(SaveError::IncompleteReload { missing });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Comparison
    // -----------------------------------------------------------------------

    /// Compare and merge every id in `to_check`.
    ///
    /// Each merge is applied with `history.replace`; one that rewrites no
    /// entity is recorded as a conflict and leaves history as it was.
    pub fn check_conflicts<H>(
        &self,
        to_check: &[EntityId],
        local: &Arc<Graph>,
        remote: &Arc<Graph>,
        history: &mut H,
    ) -> Result<ConflictCheck, SaveError>
    where
        H: History + ?Sized,
    {
        let mut check = ConflictCheck::default();

        for id in to_check {
            let local_entity = local.entity(id)?;
            let remote_entity = remote.entity(id)?;

            if compare_versions(local_entity, remote_entity, local, remote) {
                debug!(%id, "versions match");
                check.unchanged.push(id.clone());
                continue;
            }

            let merge = MergeRemoteChanges::new(id.clone(), Arc::clone(local), Arc::clone(remote))
                .with_user_formatter(self.formatter.clone());
            let outcome = merge.evaluate(history.graph())?;

            if history.replace(&merge) > 0 {
                debug!(%id, "merged remote changes");
                check.merged.push(id.clone());
                continue;
            }

            info!(%id, details = outcome.conflicts.len(), "conflict detected");
            check.conflicts.push(Conflict::new(
                local_entity,
                remote_entity,
                outcome.conflicts,
                &merge,
                self.default_choice,
            ));
        }

        check.conflicts.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(check)
    }
}

/// Whether `local` and `remote` are at the same version. A line also needs
/// every child in either node list to be present in both graphs at the same
/// version.
pub fn compare_versions(local: &Entity, remote: &Entity, local_graph: &Graph, remote_graph: &Graph) -> bool {
    if local.version != remote.version {
        return false;
    }

    if local.is_line() {
        let mut seen = HashSet::new();
        for id in local.nodes.iter().chain(&remote.nodes) {
            if !seen.insert(id) {
                continue;
            }
            match (local_graph.has_entity(id), remote_graph.has_entity(id)) {
                (Some(a), Some(b)) if a.version == b.version => {}
                _ => return false,
            }
        }
    }

    true
}
