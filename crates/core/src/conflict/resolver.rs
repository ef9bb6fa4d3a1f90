//! Conflict records and resolution.
//!
//! A [`Conflict`] is plain data: the divergent entity, the merge's detail
//! strings, and exactly two [`Choice`]s. Each choice carries the forced merge
//! action it stands for; the [`ConflictResolver`] applies it by replacing the
//! pending merge at the top of history.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::conflict::merger::{MergeOption, MergeRemoteChanges};
use crate::entity::{Entity, EntityId};
use crate::errors::ConflictError;
use crate::history::History;

/// The two resolution sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    KeepLocal,
    #[default]
    KeepRemote,
}

impl ChoiceKind {
    /// Position of this side in [`Conflict::choices`].
    pub fn index(self) -> usize {
        match self {
            Self::KeepLocal => 0,
            Self::KeepRemote => 1,
        }
    }

    pub fn merge_option(self) -> MergeOption {
        match self {
            Self::KeepLocal => MergeOption::ForceLocal,
            Self::KeepRemote => MergeOption::ForceRemote,
        }
    }
}

impl std::fmt::Display for ChoiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepLocal => write!(f, "keep_local"),
            Self::KeepRemote => write!(f, "keep_remote"),
        }
    }
}

/// One resolution option for a conflict.
#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub id: ChoiceKind,
    pub label: String,
    /// The forced merge that replaces the pending one when chosen.
    #[serde(skip)]
    pub action: MergeRemoteChanges,
}

/// An entity whose local and remote edits could not be merged automatically.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub id: EntityId,
    pub name: String,
    pub details: Vec<String>,
    /// Index of the currently selected choice.
    pub chosen: usize,
    pub choices: [Choice; 2],
}

impl Conflict {
    /// Build the conflict record for a failed safe merge.
    ///
    /// When the remote copy is deleted the choices read "Restore" and
    /// "Leave Deleted"; otherwise "Keep mine" and "Use theirs".
    pub fn new(
        local: &Entity,
        remote: &Entity,
        details: Vec<String>,
        merge: &MergeRemoteChanges,
        default_choice: ChoiceKind,
    ) -> Self {
        let (keep_local, keep_remote) = if remote.visible {
            ("Keep mine", "Use theirs")
        } else {
            ("Restore", "Leave Deleted")
        };

        let choice = |kind: ChoiceKind, label: &str| Choice {
            id: kind,
            label: label.to_string(),
            action: merge.clone().with_option(kind.merge_option()),
        };

        Self {
            id: local.id.clone(),
            name: local.display_name(),
            details,
            chosen: default_choice.index(),
            choices: [
                choice(ChoiceKind::KeepLocal, keep_local),
                choice(ChoiceKind::KeepRemote, keep_remote),
            ],
        }
    }

    pub fn choice(&self, index: usize) -> Result<&Choice, ConflictError> {
        self.choices.get(index).ok_or_else(|| ConflictError::InvalidChoice {
            id: self.id.clone(),
            index,
        })
    }

    pub fn chosen_choice(&self) -> &Choice {
        &self.choices[self.chosen.min(1)]
    }
}

/// Applies conflict choices to history.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Select `index` on `conflict` and replace the pending merge in
    /// `history` with that choice's forced action.
    pub fn apply<H>(history: &mut H, conflict: &mut Conflict, index: usize) -> Result<(), ConflictError>
    where
        H: History + ?Sized,
    {
        let choice = conflict.choice(index)?;
        let rewritten = history.replace(&choice.action);
        info!(
            id = %conflict.id,
            choice = %choice.id,
            rewritten,
            "conflict resolved"
        );
        conflict.chosen = index;
        Ok(())
    }

    /// Find a conflict by id in a pending list.
    pub fn find<'a>(conflicts: &'a mut [Conflict], id: &EntityId) -> Result<&'a mut Conflict, ConflictError> {
        if conflicts.is_empty() {
            return Err(ConflictError::NothingPending);
        }
        conflicts
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| ConflictError::NotFound(id.clone()))
    }
}
