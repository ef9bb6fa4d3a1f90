//! Error types for the mapsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::entity::EntityId;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// A failure reported by the loader or committer transport.
///
/// The status code and message are opaque to the core and only carried
/// through for display.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct TransportError {
    /// HTTP-like status code, when the transport has one.
    pub status: Option<u16>,
    /// Response text or a description of the failure.
    pub message: String,
}

impl TransportError {
    /// Create a transport error with a status code.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Create a transport error that has no status code (e.g. I/O failure).
    pub fn without_status(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

/// Errors from graph snapshot lookups.
///
/// These indicate a programming error (the caller asked for an entity the
/// snapshot never contained) and are surfaced immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The entity id is not present in the snapshot.
    #[error("entity {0} not found in graph")]
    EntityNotFound(EntityId),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from the conflict merge / resolution subsystem.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The requested conflict id is not in the pending list.
    #[error("conflict not found: {0}")]
    NotFound(EntityId),

    /// The choice index is out of range for the conflict.
    #[error("invalid choice {index} for conflict {id}")]
    InvalidChoice { id: EntityId, index: usize },

    /// No conflicts are awaiting resolution.
    #[error("no conflicts are pending resolution")]
    NothingPending,

    /// The node-list three-way merge could not be computed.
    #[error("node list merge failed: {0}")]
    NodeListMerge(String),

    /// A graph lookup failed while building a merge.
    #[error("conflict graph error: {0}")]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Save errors
// ---------------------------------------------------------------------------

/// Errors from the save orchestrator and version reconciler.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The reload or commit transport failed.
    #[error("save transport error: {0}")]
    Transport(#[from] TransportError),

    /// A graph lookup failed; this is a programming error.
    #[error("save graph error: {0}")]
    Graph(#[from] GraphError),

    /// A conflict could not be built or resolved.
    #[error("save conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// All reload requests completed but some requested entities never arrived.
    #[error("reload incomplete: {} requested entities missing from the response", .missing.len())]
    IncompleteReload { missing: Vec<EntityId> },

    /// An operation was invoked in a state that does not allow it.
    #[error("invalid save state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A reload worker task panicked or was cancelled.
    #[error("reload task failed: {0}")]
    TaskFailed(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
