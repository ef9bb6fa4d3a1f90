//! Transport interfaces for the remote authority.
//!
//! The save engine never talks to the network itself. It reloads entities
//! through an [`EntityLoader`] and submits the final change set through a
//! [`ChangesetCommitter`]; timeouts and retries belong to the implementor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::difference::ChangeSet;
use crate::entity::{Entity, EntityId};
use crate::errors::TransportError;

/// Server-assigned changeset identifier.
pub type ChangesetId = String;

/// Metadata submitted alongside a change set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetMeta {
    pub comment: String,
    #[serde(default)]
    pub imagery_used: Vec<String>,
    #[serde(default)]
    pub created_by: String,
}

/// Fetches the current remote copies of entities.
#[async_trait]
pub trait EntityLoader: Send + Sync {
    /// Load the latest version of every id in `ids`. Entities deleted on the
    /// remote are returned with `visible == false`.
    async fn load_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>, TransportError>;
}

/// Submits a change set as one atomic changeset.
#[async_trait]
pub trait ChangesetCommitter: Send + Sync {
    async fn commit_changeset(
        &self,
        changes: &ChangeSet,
        meta: &ChangesetMeta,
    ) -> Result<ChangesetId, TransportError>;
}
