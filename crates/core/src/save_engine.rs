//! Save orchestration.
//!
//! The [`SaveOrchestrator`] drives one save attempt end to end as a state
//! machine:
//!
//! 1. Checkpoint history (skipped on a retry after conflict resolution).
//! 2. Reload the remote copies of every modified entity and its children.
//! 3. Reconcile versions; merge what merges cleanly.
//! 4. Report conflicts, or commit the outgoing change set.
//!
//! Transport failures roll history back to the checkpoint and are reported
//! as error rows. Conflicts keep the checkpoint so a retry can build on the
//! chosen resolutions.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, SaveConfig};
use crate::conflict::reconciler::{ReloadPlan, VersionReconciler};
use crate::conflict::resolver::{Conflict, ConflictResolver};
use crate::difference::{discard_tags, ChangeSet};
use crate::entity::EntityId;
use crate::errors::SaveError;
use crate::graph::Graph;
use crate::history::History;
use crate::models::{ErrorReport, SaveStats};
use crate::transport::{ChangesetCommitter, ChangesetId, ChangesetMeta, EntityLoader};

// ---------------------------------------------------------------------------
// Save state machine
// ---------------------------------------------------------------------------

/// States of a save attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    Idle,
    Checkpointed,
    Loading,
    Reconciling,
    Conflicted,
    Committing,
    Failed,
}

impl std::fmt::Display for SaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Checkpointed => write!(f, "checkpointed"),
            Self::Loading => write!(f, "loading"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Conflicted => write!(f, "conflicted"),
            Self::Committing => write!(f, "committing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What the caller submits with a save.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    pub comment: String,
    #[serde(default)]
    pub imagery_used: Vec<String>,
}

impl SaveRequest {
    pub fn new(comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
            imagery_used: Vec::new(),
        }
    }
}

/// The terminal result of one attempt.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// The changeset was accepted; history has been flushed.
    Success {
        changeset_id: ChangesetId,
        comment: String,
    },
    /// Conflicts await a choice, sorted by entity id descending.
    Conflicts(Vec<Conflict>),
    /// The attempt failed and history was rolled back.
    Errors(Vec<ErrorReport>),
    /// Nothing remained to upload once noise tags were discarded; history was
    /// rolled back.
    NoChanges,
}

/// Blocking progress indicator owned by the front end.
pub trait ProgressReporter: Send + Sync {
    fn begin(&self, message: &str);
    fn end(&self);
}

/// A [`ProgressReporter`] that shows nothing.
#[derive(Debug, Default)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn begin(&self, _message: &str) {}
    fn end(&self) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives save attempts against one history.
pub struct SaveOrchestrator<H: History> {
    history: H,
    reconciler: VersionReconciler,
    committer: Arc<dyn ChangesetCommitter>,
    progress: Arc<dyn ProgressReporter>,
    config: SaveConfig,
    state: SaveState,
    conflicts: Vec<Conflict>,
    pending: Option<ChangeSet>,
    /// Ids the remote copy reported as already deleted during this attempt.
    deleted_remotely: HashSet<EntityId>,
    stats: SaveStats,
}

impl<H: History> SaveOrchestrator<H> {
    pub fn new(
        history: H,
        loader: Arc<dyn EntityLoader>,
        committer: Arc<dyn ChangesetCommitter>,
        config: &AppConfig,
    ) -> Self {
        let reconciler = VersionReconciler::new(loader)
            .with_chunk_size(config.save.reload_chunk_size)
            .with_default_choice(config.save.default_choice)
            .with_user_formatter(config.remote.user_formatter());
        Self {
            history,
            reconciler,
            committer,
            progress: Arc::new(NoopProgress),
            config: config.save.clone(),
            state: SaveState::Idle,
            conflicts: Vec::new(),
            pending: None,
            deleted_remotely: HashSet::new(),
            stats: SaveStats::default(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut H {
        &mut self.history
    }

    pub fn into_history(self) -> H {
        self.history
    }

    /// Conflicts awaiting a choice.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// The change set captured at the start of the current attempt, before
    /// any merge. Lets a user export their edits before discarding them.
    pub fn pending_changes(&self) -> Option<&ChangeSet> {
        self.pending.as_ref()
    }

    pub fn stats(&self) -> &SaveStats {
        &self.stats
    }

    /// The change set that would be committed right now. Deletions of
    /// entities the remote has already deleted are left out.
    pub fn outgoing_changes(&self) -> ChangeSet {
        let diff = self.history.difference();
        let mut changes = discard_tags(&diff, |key| self.config.is_discardable(key)).to_change_set();
        changes
            .deleted
            .retain(|e| !self.deleted_remotely.contains(&e.id));
        changes
    }

    fn set_state(&mut self, next: SaveState) {
        debug!(from = %self.state, to = %next, "save state transition");
        self.state = next;
    }

    fn invalid_transition(&self, to: SaveState) -> SaveError {
        SaveError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Run one save attempt.
    ///
    /// `retry` continues from the conflicted state after choices have been
    /// applied; it reuses the existing checkpoint. Fatal errors roll history
    /// back and are returned as `Err`. [`SaveOutcome::NoChanges`] also rolls
    /// back to the checkpoint, discarding the merges and choices of the
    /// attempt, and nothing is committed.
    pub async fn attempt_save(&mut self, request: &SaveRequest, retry: bool) -> Result<SaveOutcome, SaveError> {
        let expected = if retry { SaveState::Conflicted } else { SaveState::Idle };
        if self.state != expected {
            return Err(self.invalid_transition(SaveState::Checkpointed));
        }

        self.progress.begin("Uploading changes");
        if !retry {
            self.deleted_remotely.clear();
            self.history.checkpoint();
            self.stats = SaveStats {
                started_at: Some(Utc::now()),
                ..Default::default()
            };
        }
        self.stats.attempts += 1;
        self.conflicts.clear();
        self.set_state(SaveState::Checkpointed);

        let result = self.run_attempt(request, retry).await;
        self.progress.end();
        self.stats.completed_at = Some(Utc::now());

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(error = %err, "save attempt aborted");
                self.history.rollback_to_checkpoint();
                self.pending = None;
                self.deleted_remotely.clear();
                self.set_state(SaveState::Failed);
                self.set_state(SaveState::Idle);
                Err(err)
            }
        }
    }

    async fn run_attempt(&mut self, request: &SaveRequest, retry: bool) -> Result<SaveOutcome, SaveError> {
        if !retry {
            self.pending = Some(self.outgoing_changes());
        }

        self.set_state(SaveState::Loading);
        let plan = ReloadPlan::from_history(&self.history)?;
        self.stats.entities_checked = plan.to_check.len();
        self.stats.entities_reloaded = plan.to_load.len();

        let mut remote = Graph::from_base(self.history.base());
        if !plan.to_check.is_empty() {
            match self.reconciler.reload(&plan.to_load, &mut remote).await {
                Ok(()) => {}
                Err(err @ (SaveError::Transport(_) | SaveError::IncompleteReload { .. })) => {
                    return Ok(self.fail(vec![ErrorReport::from(&err)]));
                }
                Err(err) => return Err(err),
            }
        }

        self.set_state(SaveState::Reconciling);
        let gone = plan
            .to_load
            .iter()
            .filter(|id| remote.has_entity(id).is_some_and(|e| !e.visible))
            .cloned();
        self.deleted_remotely.extend(gone);
        let remote = Arc::new(remote);
        let check = self
            .reconciler
            .check_conflicts(&plan.to_check, &plan.local, &remote, &mut self.history)?;
        self.stats.merged += check.merged.len();
        self.stats.conflicts = check.conflicts.len();

        if !check.conflicts.is_empty() {
            info!(count = check.conflicts.len(), "conflicts detected");
            self.conflicts = check.conflicts;
            self.set_state(SaveState::Conflicted);
            return Ok(SaveOutcome::Conflicts(self.conflicts.clone()));
        }

        self.set_state(SaveState::Committing);
        let changes = self.outgoing_changes();
        if changes.is_empty() {
            info!("no significant changes to upload");
            self.history.rollback_to_checkpoint();
            self.pending = None;
            self.deleted_remotely.clear();
            self.set_state(SaveState::Idle);
            return Ok(SaveOutcome::NoChanges);
        }

        let meta = ChangesetMeta {
            comment: request.comment.clone(),
            imagery_used: request.imagery_used.clone(),
            created_by: self.config.created_by.clone(),
        };
        info!(
            created = changes.created.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "committing changeset"
        );

        match self.committer.commit_changeset(&changes, &meta).await {
            Ok(changeset_id) => {
                info!(%changeset_id, "changeset committed");
                self.history.flush();
                self.pending = None;
                self.deleted_remotely.clear();
                self.set_state(SaveState::Idle);
                Ok(SaveOutcome::Success {
                    changeset_id,
                    comment: request.comment.clone(),
                })
            }
            Err(err) => Ok(self.fail(vec![ErrorReport::from(&err)])),
        }
    }

    /// Roll back to the checkpoint and report `errors`.
    fn fail(&mut self, errors: Vec<ErrorReport>) -> SaveOutcome {
        warn!(count = errors.len(), "save attempt failed");
        self.set_state(SaveState::Failed);
        self.history.rollback_to_checkpoint();
        self.pending = None;
        self.deleted_remotely.clear();
        self.set_state(SaveState::Idle);
        SaveOutcome::Errors(errors)
    }

    // -----------------------------------------------------------------------
    // Conflict review
    // -----------------------------------------------------------------------

    /// Apply choice `index` to the pending conflict for `id`.
    pub fn resolve_conflict(&mut self, id: &EntityId, index: usize) -> Result<(), SaveError> {
        if self.state != SaveState::Conflicted {
            return Err(self.invalid_transition(SaveState::Checkpointed));
        }
        let conflict = ConflictResolver::find(&mut self.conflicts, id)?;
        ConflictResolver::apply(&mut self.history, conflict, index)?;
        Ok(())
    }

    /// Apply the pre-selected choice of every pending conflict.
    pub fn resolve_all_with_defaults(&mut self) -> Result<(), SaveError> {
        let chosen: Vec<(EntityId, usize)> = self
            .conflicts
            .iter()
            .map(|c| (c.id.clone(), c.chosen))
            .collect();
        for (id, index) in chosen {
            self.resolve_conflict(&id, index)?;
        }
        Ok(())
    }

    /// Abandon the attempt, discarding every merge and choice applied since
    /// the checkpoint.
    pub fn cancel(&mut self) -> Result<(), SaveError> {
        if self.state != SaveState::Conflicted {
            return Err(self.invalid_transition(SaveState::Idle));
        }
        self.history.rollback_to_checkpoint();
        self.conflicts.clear();
        self.pending = None;
        self.deleted_remotely.clear();
        info!("save cancelled");
        self.set_state(SaveState::Idle);
        Ok(())
    }
}
