use super::*;
use crate::domain::types::WorkflowStatus;
use crate::domain::WorkflowCommand;
use crate::event_store::WorkflowEventStore;
use crate::test_support::{cache_over, sequential_definition};
use cqrs_es::{CqrsFramework, EventStore};

fn framework(
    store: &WorkflowEventStore,
    cache: Arc<TieredCache>,
) -> (
    CqrsFramework<WorkflowAggregate, WorkflowEventStore>,
    broadcast::Receiver<RecordedEvent>,
) {
    let (event_tx, event_rx) = broadcast::channel(32);
    let projection = SnapshotProjection::new(cache, event_tx);
    let cqrs = CqrsFramework::new(
        store.clone(),
        vec![Box::new(projection)],
        crate::domain::WorkflowServices::default(),
    );
    (cqrs, event_rx)
}

#[tokio::test]
async fn test_hot_tier_reflects_commit_before_execute_returns() {
    let store = WorkflowEventStore::in_memory(0);
    let cache = cache_over(&store, 2, 4);
    let (cqrs, _rx) = framework(&store, cache.clone());
    let id = WorkflowId::from("w1");

    cqrs.execute(
        "w1",
        WorkflowCommand::CreateWorkflow {
            definition: sequential_definition("w1"),
        },
    )
    .await
    .unwrap();
    cqrs.execute("w1", WorkflowCommand::Activate).await.unwrap();

    let cached = cache.peek(&id).expect("cached");
    assert_eq!(cached.sequence, 2);
    assert_eq!(cached.status(), WorkflowStatus::Active);
    assert_eq!(cache.stats().rebuilds, 1);
}

#[tokio::test]
async fn test_projection_broadcasts_records_with_metadata() {
    let store = WorkflowEventStore::in_memory(0);
    let cache = cache_over(&store, 2, 4);
    let (cqrs, mut rx) = framework(&store, cache);

    cqrs.execute(
        "w1",
        WorkflowCommand::CreateWorkflow {
            definition: sequential_definition("w1"),
        },
    )
    .await
    .unwrap();

    let record = rx.recv().await.expect("broadcast");
    assert_eq!(record.sequence, 1);
    assert_eq!(record.workflow_id, WorkflowId::from("w1"));
    assert_eq!(record.event_type, "WorkflowCreated");
}

#[tokio::test]
async fn test_events_already_in_cache_are_skipped() {
    let store = WorkflowEventStore::in_memory(0);
    let cache = cache_over(&store, 2, 4);
    let (cqrs, _rx) = framework(&store, cache.clone());
    cqrs.execute(
        "w1",
        WorkflowCommand::CreateWorkflow {
            definition: sequential_definition("w1"),
        },
    )
    .await
    .unwrap();
    cqrs.execute("w1", WorkflowCommand::Activate).await.unwrap();

    let envelopes = store.load_events("w1").await.unwrap();
    let projection = SnapshotProjection::new(cache.clone(), broadcast::channel(4).0);
    projection.dispatch("w1", &envelopes).await;

    let cached = cache.peek(&WorkflowId::from("w1")).expect("cached");
    assert_eq!(cached.sequence, 2);
}
