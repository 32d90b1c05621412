use super::*;
use crate::domain::WorkflowCommand;
use crate::recovery::{CheckpointStore, RecoveryCheckpoint};
use crate::test_support::{drive, sequential_definition, step};
use cqrs_es::CqrsFramework;
use serde_json::json;

fn created(id: &str) -> WorkflowEvent {
    WorkflowEvent::WorkflowCreated {
        definition: sequential_definition(id),
        created_at: TimestampUtc::now(),
    }
}

fn activated() -> WorkflowEvent {
    WorkflowEvent::WorkflowActivated {
        activated_at: TimestampUtc::now(),
    }
}

fn build_cqrs_for_test(
    store: WorkflowEventStore,
) -> CqrsFramework<WorkflowAggregate, WorkflowEventStore> {
    let services = crate::domain::WorkflowServices::default();
    let queries: Vec<Box<dyn cqrs_es::Query<WorkflowAggregate>>> = Vec::new();
    CqrsFramework::new(store, queries, services)
}

#[tokio::test]
async fn test_append_assigns_monotonic_sequences() {
    let store = WorkflowEventStore::in_memory(0);
    let id = WorkflowId::from("w1");
    let meta = EventMetadata::correlated(Uuid::new_v4());

    assert_eq!(store.append(&id, created("w1"), 0, meta).await.unwrap(), 1);
    assert_eq!(store.append(&id, activated(), 1, meta).await.unwrap(), 2);

    let events = store.read(&id, 1).await.unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert!(events.iter().all(|e| e.correlation_id == meta.correlation_id));

    let tail = store.read(&id, 2).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].event_type, "WorkflowActivated");
}

#[tokio::test]
async fn test_stale_expected_sequence_is_a_conflict() {
    let store = WorkflowEventStore::in_memory(0);
    let id = WorkflowId::from("w1");
    store
        .append(&id, created("w1"), 0, EventMetadata::default())
        .await
        .unwrap();

    let err = store
        .append(&id, activated(), 0, EventMetadata::default())
        .await
        .expect_err("stale head");
    assert!(matches!(err, WorkflowError::ConcurrencyConflict { .. }));
    assert_eq!(store.head(&id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_appends_exactly_one_wins() {
    let store = WorkflowEventStore::in_memory(0);
    let id = WorkflowId::from("w1");
    store
        .append(&id, created("w1"), 0, EventMetadata::default())
        .await
        .unwrap();

    let first = {
        let store = store.clone();
        let id = id.clone();
        tokio::spawn(async move { store.append(&id, activated(), 1, EventMetadata::default()).await })
    };
    let second = {
        let store = store.clone();
        let id = id.clone();
        tokio::spawn(async move { store.append(&id, activated(), 1, EventMetadata::default()).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(WorkflowError::ConcurrencyConflict { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(store.head(&id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_snapshot_ahead_of_log_is_rejected() {
    let store = WorkflowEventStore::in_memory(0);
    let mut snapshot = WorkflowSnapshot::created(sequential_definition("w1"), TimestampUtc::now());
    snapshot.sequence = 5;
    let err = store.save_snapshot(&snapshot).await.expect_err("ahead");
    assert!(matches!(err, WorkflowError::Validation { .. }));
    assert!(store.latest_snapshot(&snapshot.workflow_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_framework_commit_snapshots_and_reload() {
    let store = WorkflowEventStore::in_memory(2);
    let cqrs = build_cqrs_for_test(store.clone());
    let id = "w1";

    cqrs.execute(
        id,
        WorkflowCommand::CreateWorkflow {
            definition: sequential_definition(id),
        },
    )
    .await
    .unwrap();
    cqrs.execute(id, WorkflowCommand::Activate).await.unwrap();
    cqrs.execute(
        id,
        WorkflowCommand::UpdateContext {
            updates: json!({"zone": "A"}).as_object().cloned().unwrap(),
        },
    )
    .await
    .unwrap();

    let workflow_id = WorkflowId::from(id);
    let stored = store.latest_snapshot(&workflow_id).await.unwrap().expect("snapshot at 2");
    assert_eq!(stored.sequence, 2);

    let loaded = store.load_snapshot(&workflow_id).await.unwrap().expect("loaded");
    let replayed = store.replay(&workflow_id).await.unwrap().expect("replayed");
    assert_eq!(loaded.sequence, 3);
    assert_eq!(loaded, replayed);
    assert_eq!(loaded.global_context.get("zone"), Some(&json!("A")));
}

#[tokio::test]
async fn test_framework_rejects_invalid_transition_without_appending() {
    let store = WorkflowEventStore::in_memory(0);
    let cqrs = build_cqrs_for_test(store.clone());
    cqrs.execute(
        "w1",
        WorkflowCommand::CreateWorkflow {
            definition: sequential_definition("w1"),
        },
    )
    .await
    .unwrap();

    let result = cqrs.execute("w1", WorkflowCommand::Complete).await;
    assert!(matches!(
        result,
        Err(AggregateError::UserError(WorkflowError::InvalidTransition { .. }))
    ));
    assert_eq!(store.head(&WorkflowId::from("w1")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_metadata_travels_on_envelopes() {
    let store = WorkflowEventStore::in_memory(0);
    let cqrs = build_cqrs_for_test(store.clone());
    let correlation = Uuid::new_v4();
    cqrs.execute_with_metadata(
        "w1",
        WorkflowCommand::CreateWorkflow {
            definition: sequential_definition("w1"),
        },
        EventMetadata::correlated(correlation).to_map(),
    )
    .await
    .unwrap();

    let envelopes = store.load_events("w1").await.unwrap();
    let record = RecordedEvent::from_envelope(&envelopes[0]).expect("full metadata");
    assert_eq!(record.correlation_id, Some(correlation));
    assert_eq!(record.sequence, 1);
}

#[tokio::test]
async fn test_replay_matches_incremental_state() {
    let store = WorkflowEventStore::in_memory(0);
    let id = WorkflowId::from("w1");
    let mut aggregate = WorkflowAggregate::default();
    let events = drive(
        &mut aggregate,
        vec![
            WorkflowCommand::CreateWorkflow {
                definition: sequential_definition("w1"),
            },
            WorkflowCommand::Activate,
            WorkflowCommand::AssignStep {
                step_id: step("s1"),
                agent_id: "a1".into(),
            },
            WorkflowCommand::StartStep { step_id: step("s1") },
            WorkflowCommand::CompleteStep {
                step_id: step("s1"),
                result: json!({"ok": true}),
            },
        ],
    )
    .await;
    store
        .append_batch(&id, events, 0, EventMetadata::default())
        .await
        .unwrap();

    let replayed = store.replay(&id).await.unwrap().expect("replayed");
    assert_eq!(Some(&replayed), aggregate.snapshot());
}

#[tokio::test]
async fn test_workflow_ids_leave_out_checkpoint_streams() {
    let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
    let store = WorkflowEventStore::new(backend.clone(), 0);
    let id = WorkflowId::from("w1");
    let mut aggregate = WorkflowAggregate::default();
    let events = drive(
        &mut aggregate,
        vec![
            WorkflowCommand::CreateWorkflow {
                definition: sequential_definition("w1"),
            },
            WorkflowCommand::Activate,
        ],
    )
    .await;
    store
        .append_batch(&id, events, 0, EventMetadata::default())
        .await
        .unwrap();

    let snapshot = aggregate.snapshot().expect("created");
    let checkpoint = RecoveryCheckpoint::capture(snapshot, "activated", Default::default());
    CheckpointStore::new(backend, 3).save(&checkpoint).await.unwrap();

    assert_eq!(store.workflow_ids().await.unwrap(), vec![id]);
}

#[test]
fn test_should_snapshot() {
    assert!(!should_snapshot(5, 0));
    assert!(should_snapshot(50, 50));
    assert!(!should_snapshot(51, 50));
}
