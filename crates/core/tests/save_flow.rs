//! End-to-end tests for the save flow.
//!
//! These tests drive the real `SaveOrchestrator` over an `EditHistory`, with
//! in-memory loader and committer transports standing in for the remote
//! authority.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mapsync_core::conflict::ChoiceKind;
use mapsync_core::difference::ChangeSet;
use mapsync_core::errors::{SaveError, TransportError};
use mapsync_core::history::{ApplyEdits, Edit};
use mapsync_core::transport::{ChangesetCommitter, ChangesetId, ChangesetMeta, EntityLoader};
use mapsync_core::{
    AppConfig, EditHistory, Entity, EntityId, Graph, History, Location, Member, SaveOrchestrator,
    SaveOutcome, SaveRequest, SaveState,
};

// ===========================================================================
// Helpers
// ===========================================================================

/// Serves entities from a fixed remote snapshot.
struct MockLoader {
    remote: Mutex<Graph>,
    calls: AtomicUsize,
    fail_with: Mutex<Option<TransportError>>,
}

impl MockLoader {
    fn new(remote: Graph) -> Arc<Self> {
        Arc::new(Self {
            remote: Mutex::new(remote),
            calls: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
        })
    }

    fn failing(err: TransportError) -> Arc<Self> {
        let loader = Self::new(Graph::default());
        *loader.fail_with.lock().unwrap() = Some(err);
        loader
    }
}

#[async_trait]
impl EntityLoader for MockLoader {
    async fn load_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        let remote = self.remote.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| remote.has_entity(id).cloned())
            .collect())
    }
}

/// Records every submitted changeset.
#[derive(Default)]
struct MockCommitter {
    commits: Mutex<Vec<(ChangeSet, ChangesetMeta)>>,
    fail_with: Option<TransportError>,
}

#[async_trait]
impl ChangesetCommitter for MockCommitter {
    async fn commit_changeset(
        &self,
        changes: &ChangeSet,
        meta: &ChangesetMeta,
    ) -> Result<ChangesetId, TransportError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let mut commits = self.commits.lock().unwrap();
        commits.push((changes.clone(), meta.clone()));
        Ok(format!("{}", 5000 + commits.len()))
    }
}

/// Base snapshot: a residential street with three points and a route
/// relation, all as last downloaded.
fn base_graph() -> Graph {
    Graph::new(vec![
        Entity::point("n1", Location::new(13.0, 52.0)).with_version(1),
        Entity::point("n2", Location::new(13.1, 52.0)).with_version(1),
        Entity::point("n3", Location::new(13.2, 52.0)).with_version(1),
        Entity::point("n10", Location::new(13.5, 52.5))
            .with_version(3)
            .with_tag("amenity", "cafe"),
        Entity::line("w1", ["n1", "n2", "n3"])
            .with_version(4)
            .with_tag("highway", "residential"),
        Entity::relation("r1", vec![Member::new("w1", "")])
            .with_version(2)
            .with_tag("type", "route"),
    ])
}

fn entity(graph: &Graph, id: &str) -> Entity {
    graph.entity(&EntityId::new(id)).unwrap().clone()
}

fn edit(history: &mut EditHistory, annotation: &str, entities: Vec<Entity>) {
    let edits = entities.into_iter().map(Edit::Replace).collect();
    history.perform(&ApplyEdits::new(annotation, edits));
}

/// A remote snapshot seeded from base with some entities updated.
fn remote_with(base: &Graph, updated: Vec<Entity>) -> Graph {
    let mut remote = base.clone();
    for e in updated {
        remote.replace(e);
    }
    remote
}

fn orchestrator(
    history: EditHistory,
    loader: Arc<MockLoader>,
    committer: Arc<MockCommitter>,
) -> SaveOrchestrator<EditHistory> {
    SaveOrchestrator::new(history, loader, committer, &AppConfig::default())
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn test_unchanged_remote_commits_local_edit() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "name cafe",
        vec![entity(&base, "n10").with_tag("name", "Foo")],
    );

    let loader = MockLoader::new(base.clone());
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, loader.clone(), committer.clone());

    let outcome = save
        .attempt_save(&SaveRequest::new("Name the cafe"), false)
        .await
        .unwrap();
    match outcome {
        SaveOutcome::Success {
            changeset_id,
            comment,
        } => {
            assert_eq!(changeset_id, "5001");
            assert_eq!(comment, "Name the cafe");
        }
        other => panic!("expected success, got {other:?}"),
    }

    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    let commits = committer.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    let (changes, meta) = &commits[0];
    assert_eq!(changes.modified.len(), 1);
    assert_eq!(changes.modified[0].tag("name"), Some("Foo"));
    assert_eq!(changes.modified[0].version, Some(3));
    assert_eq!(meta.comment, "Name the cafe");

    assert_eq!(save.state(), SaveState::Idle);
    assert!(save.history().is_empty());
}

#[tokio::test]
async fn test_disjoint_line_edits_merge_silently() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "extend street",
        vec![
            Entity::point("n-1", Location::new(13.3, 52.0)),
            Entity::line("w1", ["n1", "n2", "n3", "n-1"])
                .with_version(4)
                .with_tag("highway", "residential"),
        ],
    );

    let remote = remote_with(
        &base,
        vec![entity(&base, "w1")
            .with_version(5)
            .with_tag("name", "Lindenstraße")
            .with_user("alice")],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(remote), committer.clone());

    let outcome = save
        .attempt_save(&SaveRequest::new("Extend street"), false)
        .await
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Success { .. }), "{outcome:?}");
    assert!(save.conflicts().is_empty());
    assert_eq!(save.stats().merged, 1);

    let commits = committer.commits.lock().unwrap();
    let (changes, _) = &commits[0];
    assert_eq!(changes.created.len(), 1);
    let w1 = changes
        .modified
        .iter()
        .find(|e| e.id.as_str() == "w1")
        .expect("w1 modified");
    assert_eq!(w1.version, Some(5));
    assert_eq!(w1.tag("name"), Some("Lindenstraße"));
    assert_eq!(w1.nodes.last().map(EntityId::as_str), Some("n-1"));
}

#[tokio::test]
async fn test_tag_conflict_keep_remote_then_retry() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "upgrade street",
        vec![entity(&base, "w1").with_tag("highway", "primary")],
    );

    let remote = remote_with(
        &base,
        vec![entity(&base, "w1")
            .with_version(5)
            .with_tag("highway", "secondary")
            .with_user("bob")],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(remote), committer.clone());
    let request = SaveRequest::new("Upgrade street");

    let outcome = save.attempt_save(&request, false).await.unwrap();
    let conflicts = match outcome {
        SaveOutcome::Conflicts(conflicts) => conflicts,
        other => panic!("expected conflicts, got {other:?}"),
    };
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.id.as_str(), "w1");
    assert_eq!(conflict.chosen, ChoiceKind::KeepRemote.index());
    assert_eq!(conflict.choices[0].label, "Keep mine");
    assert_eq!(conflict.choices[1].label, "Use theirs");
    assert_eq!(conflict.details.len(), 1);
    assert!(conflict.details[0].contains("bob"));
    assert_eq!(save.state(), SaveState::Conflicted);
    assert!(committer.commits.lock().unwrap().is_empty());

    save.resolve_conflict(&EntityId::new("w1"), 1).unwrap();
    let outcome = save.attempt_save(&request, true).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Success { .. }), "{outcome:?}");

    let commits = committer.commits.lock().unwrap();
    let (changes, _) = &commits[0];
    assert_eq!(changes.modified.len(), 1);
    assert_eq!(changes.modified[0].tag("highway"), Some("secondary"));
    assert_eq!(changes.modified[0].version, Some(5));
}

#[tokio::test]
async fn test_keep_local_uploads_local_value_at_remote_version() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "upgrade street",
        vec![entity(&base, "w1").with_tag("highway", "primary")],
    );
    let remote = remote_with(
        &base,
        vec![entity(&base, "w1")
            .with_version(5)
            .with_tag("highway", "secondary")],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(remote), committer.clone());
    let request = SaveRequest::new("Upgrade street");

    save.attempt_save(&request, false).await.unwrap();
    save.resolve_conflict(&EntityId::new("w1"), 0).unwrap();
    save.attempt_save(&request, true).await.unwrap();

    let commits = committer.commits.lock().unwrap();
    let w1 = &commits[0].0.modified[0];
    assert_eq!(w1.tag("highway"), Some("primary"));
    assert_eq!(w1.version, Some(5));
}

#[tokio::test]
async fn test_reload_error_rolls_back() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "name cafe",
        vec![entity(&base, "n10").with_tag("name", "Foo")],
    );
    let before = history.graph().clone();

    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(
        history,
        MockLoader::failing(TransportError::new(504, "Gateway Timeout")),
        committer.clone(),
    );

    let outcome = save
        .attempt_save(&SaveRequest::new("Name the cafe"), false)
        .await
        .unwrap();
    let errors = match outcome {
        SaveOutcome::Errors(errors) => errors,
        other => panic!("expected errors, got {other:?}"),
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "Gateway Timeout");
    assert_eq!(errors[0].details, vec!["status code: 504".to_string()]);

    assert!(committer.commits.lock().unwrap().is_empty());
    assert_eq!(save.state(), SaveState::Idle);
    assert_eq!(save.history().len(), 1);
    assert!(!save.history().has_checkpoint());
    assert_eq!(save.history().graph().rewritten_since(&before), 0);
}

#[tokio::test]
async fn test_commit_error_rolls_back() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "name cafe",
        vec![entity(&base, "n10").with_tag("name", "Foo")],
    );

    let committer = Arc::new(MockCommitter {
        fail_with: Some(TransportError::new(409, "Changeset already closed")),
        ..Default::default()
    });
    let mut save = orchestrator(history, MockLoader::new(base.clone()), committer);

    let outcome = save
        .attempt_save(&SaveRequest::new("Name the cafe"), false)
        .await
        .unwrap();
    match outcome {
        SaveOutcome::Errors(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].details, vec!["status code: 409".to_string()]);
        }
        other => panic!("expected errors, got {other:?}"),
    }
    assert_eq!(save.history().len(), 1);
    assert_eq!(
        entity(save.history().graph(), "n10").tag("name"),
        Some("Foo")
    );
}

#[tokio::test]
async fn test_cancel_restores_pre_attempt_history() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    // one clean merge and one conflict in the same attempt
    edit(
        &mut history,
        "edits",
        vec![
            entity(&base, "w1").with_tag("highway", "primary"),
            entity(&base, "n10").with_tag("name", "Foo"),
        ],
    );
    let before = history.graph().clone();
    let annotations = history.annotations();

    let remote = remote_with(
        &base,
        vec![
            entity(&base, "w1")
                .with_version(5)
                .with_tag("highway", "secondary"),
            entity(&base, "n10")
                .with_version(4)
                .with_tag("opening_hours", "Mo-Fr 08:00-18:00"),
        ],
    );
    let mut save = orchestrator(
        history,
        MockLoader::new(remote),
        Arc::new(MockCommitter::default()),
    );

    let outcome = save
        .attempt_save(&SaveRequest::new("edits"), false)
        .await
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Conflicts(ref c) if c.len() == 1));
    // the clean merge is applied speculatively
    assert_eq!(entity(save.history().graph(), "n10").version, Some(4));
    assert!(save.pending_changes().is_some());

    save.resolve_conflict(&EntityId::new("w1"), 0).unwrap();
    save.cancel().unwrap();

    assert_eq!(save.state(), SaveState::Idle);
    assert!(save.conflicts().is_empty());
    assert!(save.pending_changes().is_none());
    let history = save.into_history();
    assert_eq!(history.annotations(), annotations);
    assert_eq!(history.graph().rewritten_since(&before), 0);
    assert!(!history.has_checkpoint());
}

// ===========================================================================
// Supplementary behaviour
// ===========================================================================

#[tokio::test]
async fn test_conflicts_reported_in_descending_id_order() {
    let base = Graph::new(
        ["b", "a", "c"]
            .iter()
            .map(|id| Entity::point(*id, Location::new(0.0, 0.0)).with_version(1)),
    );
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "rename all",
        ["b", "a", "c"]
            .iter()
            .map(|id| entity(&base, id).with_tag("name", "mine"))
            .collect(),
    );
    let remote = remote_with(
        &base,
        ["a", "b", "c"]
            .iter()
            .map(|id| entity(&base, id).with_version(2).with_tag("name", "theirs"))
            .collect(),
    );
    let mut save = orchestrator(
        history,
        MockLoader::new(remote),
        Arc::new(MockCommitter::default()),
    );

    let outcome = save
        .attempt_save(&SaveRequest::new("rename"), false)
        .await
        .unwrap();
    let SaveOutcome::Conflicts(conflicts) = outcome else {
        panic!("expected conflicts");
    };
    let order: Vec<&str> = conflicts.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(order, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_deleted_on_remote_leave_deleted() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "tag cafe and corner",
        vec![
            entity(&base, "n10").with_tag("cuisine", "coffee_shop"),
            entity(&base, "n1").with_tag("name", "Corner"),
        ],
    );
    let remote = remote_with(
        &base,
        vec![entity(&base, "n10").with_version(4).deleted()],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(remote), committer.clone());
    let request = SaveRequest::new("tag cafe");

    let outcome = save.attempt_save(&request, false).await.unwrap();
    let SaveOutcome::Conflicts(conflicts) = outcome else {
        panic!("expected conflicts");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].choices[0].label, "Restore");
    assert_eq!(conflicts[0].choices[1].label, "Leave Deleted");
    assert_eq!(
        conflicts[0].details,
        vec!["This object has been deleted by another user.".to_string()]
    );

    save.resolve_all_with_defaults().unwrap();
    assert!(save.history().graph().has_entity(&"n10".into()).is_none());

    let outcome = save.attempt_save(&request, true).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Success { .. }), "{outcome:?}");
    let commits = committer.commits.lock().unwrap();
    let (changes, _) = &commits[0];
    // the remote already deleted n10 at a newer version
    assert!(changes.deleted.is_empty());
    assert_eq!(changes.modified.len(), 1);
    assert_eq!(changes.modified[0].id.as_str(), "n1");
}

#[tokio::test]
async fn test_relation_member_and_tag_edits_merge() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "name route",
        vec![entity(&base, "r1").with_tag("name", "Local Route")],
    );
    let remote = remote_with(
        &base,
        vec![Entity::relation("r1", vec![Member::new("w1", ""), Member::new("n1", "stop")])
            .with_version(3)
            .with_tag("type", "route")],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(remote), committer.clone());

    let outcome = save
        .attempt_save(&SaveRequest::new("Name route"), false)
        .await
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Success { .. }), "{outcome:?}");

    let commits = committer.commits.lock().unwrap();
    let r1 = &commits[0].0.modified[0];
    assert_eq!(r1.id.as_str(), "r1");
    assert_eq!(r1.version, Some(3));
    assert_eq!(r1.members.len(), 2);
    assert_eq!(r1.members[1].role, "stop");
    assert_eq!(r1.tag("name"), Some("Local Route"));
    assert_eq!(r1.tag("type"), Some("route"));
}

#[tokio::test]
async fn test_point_and_parent_line_edited_on_both_sides() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "tag street",
        vec![
            entity(&base, "n1").with_tag("name", "Local"),
            entity(&base, "w1").with_tag("lanes", "2"),
        ],
    );
    let remote = remote_with(
        &base,
        vec![
            entity(&base, "n1").with_version(2).with_tag("amenity", "bench"),
            entity(&base, "w1").with_version(5).with_tag("name", "Elm"),
        ],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(remote), committer.clone());

    let outcome = save
        .attempt_save(&SaveRequest::new("Tag street"), false)
        .await
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Success { .. }), "{outcome:?}");

    let commits = committer.commits.lock().unwrap();
    let modified = &commits[0].0.modified;
    assert_eq!(modified.len(), 2);
    let n1 = modified.iter().find(|e| e.id.as_str() == "n1").unwrap();
    assert_eq!(n1.version, Some(2));
    assert_eq!(n1.tag("name"), Some("Local"));
    assert_eq!(n1.tag("amenity"), Some("bench"));
    let w1 = modified.iter().find(|e| e.id.as_str() == "w1").unwrap();
    assert_eq!(w1.version, Some(5));
    assert_eq!(w1.tag("lanes"), Some("2"));
    assert_eq!(w1.tag("name"), Some("Elm"));
}

#[tokio::test]
async fn test_commit_error_on_retry_rolls_back_to_checkpoint() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "upgrade street",
        vec![entity(&base, "w1").with_tag("highway", "primary")],
    );
    let remote = remote_with(
        &base,
        vec![entity(&base, "w1")
            .with_version(5)
            .with_tag("highway", "secondary")],
    );
    let committer = Arc::new(MockCommitter {
        fail_with: Some(TransportError::new(500, "Internal Server Error")),
        ..Default::default()
    });
    let mut save = orchestrator(history, MockLoader::new(remote), committer);
    let request = SaveRequest::new("Upgrade street");

    let outcome = save.attempt_save(&request, false).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Conflicts(_)));
    save.resolve_conflict(&EntityId::new("w1"), 1).unwrap();
    assert_eq!(
        entity(save.history().graph(), "w1").tag("highway"),
        Some("secondary")
    );

    let outcome = save.attempt_save(&request, true).await.unwrap();
    match outcome {
        SaveOutcome::Errors(errors) => {
            assert_eq!(errors[0].message, "Internal Server Error");
        }
        other => panic!("expected errors, got {other:?}"),
    }

    assert_eq!(save.state(), SaveState::Idle);
    assert!(!save.history().has_checkpoint());
    assert_eq!(save.history().len(), 1);
    let w1 = entity(save.history().graph(), "w1");
    assert_eq!(w1.tag("highway"), Some("primary"));
    assert_eq!(w1.version, Some(4));
    assert!(save.conflicts().is_empty());
}

#[tokio::test]
async fn test_incomplete_reload_is_reported() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "tag street",
        vec![entity(&base, "w1").with_tag("lit", "yes")],
    );
    // remote lost a child point
    let mut remote = base.clone();
    remote.remove(&EntityId::new("n2"));

    let mut save = orchestrator(
        history,
        MockLoader::new(remote),
        Arc::new(MockCommitter::default()),
    );
    let outcome = save
        .attempt_save(&SaveRequest::new("tag street"), false)
        .await
        .unwrap();
    match outcome {
        SaveOutcome::Errors(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].details, vec!["missing: n2".to_string()]);
        }
        other => panic!("expected errors, got {other:?}"),
    }
    assert_eq!(save.history().len(), 1);
}

#[tokio::test]
async fn test_discardable_tags_are_stripped_from_upload() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "tag cafe",
        vec![entity(&base, "n10")
            .with_tag("name", "Foo")
            .with_tag("created_by", "old editor")],
    );
    let committer = Arc::new(MockCommitter::default());
    let mut save = orchestrator(history, MockLoader::new(base.clone()), committer.clone());

    save.attempt_save(&SaveRequest::new("tag cafe"), false)
        .await
        .unwrap();
    let commits = committer.commits.lock().unwrap();
    let n10 = &commits[0].0.modified[0];
    assert_eq!(n10.tag("name"), Some("Foo"));
    assert!(n10.tag("created_by").is_none());
}

#[tokio::test]
async fn test_attempt_while_conflicted_is_rejected() {
    let base = base_graph();
    let mut history = EditHistory::new(base.clone());
    edit(
        &mut history,
        "upgrade street",
        vec![entity(&base, "w1").with_tag("highway", "primary")],
    );
    let remote = remote_with(
        &base,
        vec![entity(&base, "w1")
            .with_version(5)
            .with_tag("highway", "secondary")],
    );
    let mut save = orchestrator(
        history,
        MockLoader::new(remote),
        Arc::new(MockCommitter::default()),
    );
    let request = SaveRequest::new("Upgrade street");
    save.attempt_save(&request, false).await.unwrap();

    let err = save.attempt_save(&request, false).await.unwrap_err();
    assert!(matches!(err, SaveError::InvalidStateTransition { .. }));
    assert_eq!(save.state(), SaveState::Conflicted);
}
