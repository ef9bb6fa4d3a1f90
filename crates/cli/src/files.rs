//! File-backed snapshots and transports.
//!
//! The CLI reads three JSON documents: the base snapshot the edits were made
//! against, the local edits, and the current remote snapshot. The remote
//! snapshot backs an [`EntityLoader`]; committed changesets are written to
//! disk by a [`ChangesetCommitter`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mapsync_core::difference::ChangeSet;
use mapsync_core::errors::TransportError;
use mapsync_core::history::{ApplyEdits, Edit};
use mapsync_core::transport::{ChangesetCommitter, ChangesetId, ChangesetMeta, EntityLoader};
use mapsync_core::{EditHistory, Entity, EntityId, Graph, History};

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A snapshot file: every entity at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub entities: Vec<Entity>,
}

/// A local edits file, applied as one history step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditsFile {
    #[serde(default = "default_annotation")]
    pub annotation: String,
    /// Entities created or changed locally.
    #[serde(default)]
    pub replace: Vec<Entity>,
    /// Entities deleted locally.
    #[serde(default)]
    pub remove: Vec<EntityId>,
}

fn default_annotation() -> String {
    "Local edits".into()
}

impl EditsFile {
    pub fn to_action(&self) -> ApplyEdits {
        let edits = self
            .replace
            .iter()
            .cloned()
            .map(Edit::Replace)
            .chain(self.remove.iter().cloned().map(Edit::Remove))
            .collect();
        ApplyEdits::new(self.annotation.clone(), edits)
    }
}

/// What the committer writes for each accepted changeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedChangeset {
    pub id: ChangesetId,
    pub committed_at: DateTime<Utc>,
    pub meta: ChangesetMeta,
    pub changes: ChangeSet,
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

pub fn load_snapshot(path: &Path) -> Result<Graph> {
    let snapshot: SnapshotFile = read_json(path)?;
    debug!(path = %path.display(), entities = snapshot.entities.len(), "snapshot loaded");
    Ok(Graph::new(snapshot.entities))
}

/// Build a history with the edits file applied on top of the base snapshot.
pub fn load_history(base: &Path, edits: &Path) -> Result<EditHistory> {
    let mut history = EditHistory::new(load_snapshot(base)?);
    let edits: EditsFile = read_json(edits)?;
    let rewritten = history.perform(&edits.to_action());
    info!(rewritten, "local edits applied");
    Ok(history)
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Serves entities from a remote snapshot file.
pub struct FileLoader {
    remote: Graph,
}

impl FileLoader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            remote: load_snapshot(path)?,
        })
    }
}

#[async_trait]
impl EntityLoader for FileLoader {
    async fn load_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>, TransportError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.remote.has_entity(id).cloned())
            .collect())
    }
}

/// Writes each committed changeset as a JSON file.
pub struct FileCommitter {
    output: PathBuf,
}

impl FileCommitter {
    pub fn new(output: PathBuf) -> Self {
        Self { output }
    }
}

#[async_trait]
impl ChangesetCommitter for FileCommitter {
    async fn commit_changeset(
        &self,
        changes: &ChangeSet,
        meta: &ChangesetMeta,
    ) -> Result<ChangesetId, TransportError> {
        let committed_at = Utc::now();
        let record = CommittedChangeset {
            id: committed_at.timestamp_millis().to_string(),
            committed_at,
            meta: meta.clone(),
            changes: changes.clone(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| TransportError::without_status(e.to_string()))?;
        tokio::fs::write(&self.output, json)
            .await
            .map_err(|e| TransportError::without_status(format!("{}: {e}", self.output.display())))?;
        info!(id = %record.id, path = %self.output.display(), "changeset written");
        Ok(record.id)
    }
}
