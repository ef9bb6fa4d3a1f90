//! Domain model types shared by the save engine and its callers.
//!
//! These types are what a front end displays: error rows and per-attempt
//! statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SaveError, TransportError};

// ---------------------------------------------------------------------------
// Error reports
// ---------------------------------------------------------------------------

/// A user-visible failure: a message plus expandable detail lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

impl From<&TransportError> for ErrorReport {
    fn from(err: &TransportError) -> Self {
        let message = if err.message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            err.message.clone()
        };
        Self {
            message,
            details: err
                .status
                .map(|code| vec![format!("status code: {code}")])
                .unwrap_or_default(),
        }
    }
}

impl From<&SaveError> for ErrorReport {
    fn from(err: &SaveError) -> Self {
        match err {
            SaveError::Transport(transport) => transport.into(),
            SaveError::IncompleteReload { missing } => {
                let mut report = ErrorReport::new(err.to_string());
                report.details = missing.iter().map(|id| format!("missing: {id}")).collect();
                report
            }
            other => ErrorReport::new(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Save statistics
// ---------------------------------------------------------------------------

/// Counters for the most recent save attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveStats {
    /// Attempts since the last checkpoint, retries included.
    pub attempts: u32,
    pub entities_checked: usize,
    pub entities_reloaded: usize,
    pub merged: usize,
    pub conflicts: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
