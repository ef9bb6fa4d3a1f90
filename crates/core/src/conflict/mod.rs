//! Conflict detection, three-way merging, and resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Reconciling** -- reloading remote copies and comparing versions.
//! 2. **Merging** -- three-way merging one entity against its remote copy.
//! 3. **Resolution** -- conflict records whose choices replace the pending merge.

pub mod merger;
pub mod reconciler;
pub mod resolver;

pub use merger::{merge_node_lists, MergeOption, MergeOutcome, MergeRemoteChanges, UserFormatter};
pub use reconciler::{compare_versions, ConflictCheck, ReloadPlan, VersionReconciler};
pub use resolver::{Choice, ChoiceKind, Conflict, ConflictResolver};
