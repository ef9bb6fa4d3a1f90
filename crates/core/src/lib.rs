//! mapsync core library.
//!
//! This crate reconciles local edits to a versioned entity graph against the
//! current state of a remote authority: graph snapshots, the difference
//! engine, edit history, version reconciliation, three-way merging, conflict
//! resolution, and the save orchestrator that commits the result as one
//! changeset.

pub mod config;
pub mod conflict;
pub mod difference;
pub mod entity;
pub mod errors;
pub mod graph;
pub mod history;
pub mod models;
pub mod save_engine;
pub mod transport;

// Re-exports for convenience.
pub use config::AppConfig;
pub use entity::{Entity, EntityId, EntityKind, Location, Member};
pub use graph::Graph;
pub use history::{EditHistory, History};
pub use save_engine::{SaveOrchestrator, SaveOutcome, SaveRequest, SaveState};
