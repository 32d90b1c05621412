use super::*;
use crate::consistency::{ConsistencyLevel, InMemoryCloud};
use crate::dependency::DependencyType;
use crate::domain::condition::Condition;
use crate::domain::cqrs::{EventKind, WorkflowEvent};
use crate::domain::types::{StepConstraints, StepStatus, StepType, TimestampUtc, WorkflowStepDefinition};
use crate::test_support::{sequential_definition, single_step_definition, step};
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::mpsc;

#[path = "coordination_tests.rs"]
mod coordination_tests;

struct FirstCandidate;

#[async_trait]
impl AgentSelector for FirstCandidate {
    async fn select(&self, request: &StepRequest) -> Option<AgentId> {
        request.candidates.first().cloned()
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl LifecycleSink for RecordingSink {
    fn emit(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Default)]
struct CountingHandler {
    seen: AtomicUsize,
}

impl EventHandler for CountingHandler {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn handle(&self, _event: &RecordedEvent, _snapshot: &WorkflowSnapshot) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }
}

fn builder() -> (WorkflowEngineBuilder, mpsc::Receiver<Directive>) {
    let (adapter, directives) = ChannelAdapter::new(512);
    let builder = WorkflowEngine::builder(Arc::new(FirstCandidate))
        .adapter(Arc::new(adapter))
        .background_tasks(false);
    (builder, directives)
}

async fn engine() -> (WorkflowEngine, mpsc::Receiver<Directive>) {
    let (builder, directives) = builder();
    (builder.start().await.unwrap(), directives)
}

fn drain(directives: &mut mpsc::Receiver<Directive>) -> Vec<Directive> {
    let mut drained = Vec::new();
    while let Ok(directive) = directives.try_recv() {
        drained.push(directive);
    }
    drained
}

async fn kinds(engine: &WorkflowEngine, id: &WorkflowId) -> Vec<EventKind> {
    engine
        .events(id)
        .await
        .unwrap()
        .iter()
        .map(|record| record.event.kind())
        .collect()
}

#[tokio::test]
async fn test_sequential_workflow_runs_to_completion() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();

    let outcome = engine.start(&id).await.unwrap();
    assert!(outcome.is_activated());
    let snapshot = outcome.snapshot();
    assert_eq!(snapshot.status(), WorkflowStatus::Active);
    assert_eq!(snapshot.step_status(&step("s1")), Some(StepStatus::Running));
    assert_eq!(snapshot.step_status(&step("s2")), Some(StepStatus::Pending));
    assert_eq!(snapshot.assigned_agents.get(&step("s1")), Some(&AgentId::from("a1")));

    let sent = drain(&mut directives);
    assert!(sent.iter().any(|d| matches!(
        d,
        Directive::Started { step_id, iteration: 1, .. } if step_id == &step("s1")
    )));

    for name in ["s1", "s2", "s3"] {
        engine
            .complete_step(&id, &step(name), json!({ "done": name }))
            .await
            .unwrap();
    }

    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.status(), WorkflowStatus::Completed);
    assert!(snapshot.all_steps_done());

    let kinds = kinds(&engine, &id).await;
    assert_eq!(kinds.first(), Some(&EventKind::WorkflowCreated));
    assert_eq!(kinds.last(), Some(&EventKind::WorkflowCompleted));
    let checkpoints = engine.recovery().checkpoints().list(&id).await.unwrap();
    assert_eq!(checkpoints.len(), 4);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_follow_up_events_share_correlation() {
    let (engine, _directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();

    let events = engine.events(&id).await.unwrap();
    let activated = events
        .iter()
        .find(|record| record.event.kind() == EventKind::WorkflowActivated)
        .unwrap();
    let started = events
        .iter()
        .find(|record| record.event.kind() == EventKind::StepStarted)
        .unwrap();
    assert!(activated.correlation_id.is_some());
    assert_eq!(started.correlation_id, activated.correlation_id);

    let checkpoint = events
        .iter()
        .find(|record| record.event.kind() == EventKind::CheckpointRecorded)
        .unwrap();
    assert_eq!(checkpoint.causation_id, Some(activated.event_id));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cyclic_dependency_leaves_graph_unchanged() {
    let (engine, _directives) = engine().await;
    engine
        .add_dependency(WorkflowDependency::new("a", "b", DependencyType::Sequential))
        .unwrap();

    let err = engine
        .add_dependency(WorkflowDependency::new("b", "a", DependencyType::Sequential))
        .unwrap_err();
    assert!(matches!(err, WorkflowError::CyclicDependency { .. }));
    assert_eq!(engine.graph().edges().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_unmet_dependency_defers_until_upstream_completes() {
    let (engine, _directives) = engine().await;
    let upstream = WorkflowId::from("up");
    let downstream = WorkflowId::from("down");
    engine
        .create(single_step_definition("up", "arm-1", 5, StepConstraints::default()))
        .await
        .unwrap();
    engine
        .create(single_step_definition("down", "arm-2", 5, StepConstraints::default()))
        .await
        .unwrap();
    engine
        .add_dependency(WorkflowDependency::new("up", "down", DependencyType::Sequential))
        .unwrap();

    let outcome = engine.start(&downstream).await.unwrap();
    let StartOutcome::Deferred { snapshot, reasons } = outcome else {
        panic!("start must be deferred");
    };
    assert_eq!(snapshot.status(), WorkflowStatus::Pending);
    assert_eq!(reasons.len(), 1);
    assert_eq!(engine.deferred().len(), 1);

    engine.start(&upstream).await.unwrap();
    engine
        .complete_step(&upstream, &step("work"), json!(null))
        .await
        .unwrap();

    let snapshot = engine.snapshot(&downstream).await.unwrap();
    assert_eq!(snapshot.status(), WorkflowStatus::Active);
    assert_eq!(snapshot.step_status(&step("work")), Some(StepStatus::Running));
    assert!(engine.deferred().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_reported_agent_failure_restores_checkpoint() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();
    engine
        .complete_step(&id, &step("s1"), json!({ "ok": true }))
        .await
        .unwrap();
    drain(&mut directives);

    let signal = FailureSignal::new(id.clone(), FailureKind::AgentFailure, "gripper jammed")
        .for_step(step("s2"));
    let plan = engine.report_failure(signal).await.unwrap();
    assert_eq!(plan.severity, 5);
    assert_eq!(plan.strategy, crate::domain::failure::RecoveryStrategy::CheckpointRestore);
    let checkpoint_id = plan.checkpoint_id.expect("restored from a checkpoint");

    let checkpoint = engine
        .recovery()
        .checkpoints()
        .get(&id, checkpoint_id)
        .await
        .unwrap()
        .expect("checkpoint kept");
    let events = engine.events(&id).await.unwrap();
    let restored = events
        .iter()
        .find_map(|record| match &record.event {
            WorkflowEvent::CheckpointRestored { checkpoint_id: restored_id, state, .. } => {
                Some((*restored_id, state.clone()))
            }
            _ => None,
        })
        .expect("checkpoint restored");
    assert_eq!(restored.0, checkpoint_id);
    assert_eq!(restored.1, checkpoint.state);

    let sent = drain(&mut directives);
    assert!(sent.iter().any(|d| matches!(
        d,
        Directive::Cancel { step_id, agent_id: Some(agent), .. }
            if step_id == &step("s2") && agent == &AgentId::from("a1")
    )));

    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.step_status(&step("s1")), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status(&step("s2")), Some(StepStatus::Running));
    assert_eq!(snapshot.recoveries, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_restore_redispatches_parallel_step_running_at_checkpoint() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    let definition = WorkflowDefinition::new(
        "w",
        vec![
            WorkflowStepDefinition::new("p1", StepType::Parallel),
            WorkflowStepDefinition::new("p2", StepType::Parallel),
        ],
    )
    .with_candidates(vec![AgentId::from("a1")]);
    engine.create(definition).await.unwrap();
    engine.start(&id).await.unwrap();
    engine.complete_step(&id, &step("p1"), json!("picked")).await.unwrap();

    let checkpoint = engine
        .recovery()
        .checkpoints()
        .latest(&id)
        .await
        .unwrap()
        .expect("checkpoint after p1");
    assert_eq!(checkpoint.label, "completed p1");
    assert_eq!(checkpoint.state.steps[&step("p2")].status, StepStatus::Running);
    drain(&mut directives);

    engine.fail_step(&id, &step("p2"), "gripper jammed").await.unwrap();

    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.recoveries, 1);
    assert_eq!(snapshot.status(), WorkflowStatus::Active);
    assert_eq!(snapshot.step_status(&step("p1")), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status(&step("p2")), Some(StepStatus::Running));
    let sent = drain(&mut directives);
    assert!(sent.iter().any(|d| matches!(
        d,
        Directive::Started { step_id, .. } if step_id == &step("p2")
    )));

    engine.complete_step(&id, &step("p2"), json!("placed")).await.unwrap();
    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.status(), WorkflowStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_network_step_failure_is_retried_after_backoff() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();
    drain(&mut directives);

    let snapshot = engine
        .fail_step(&id, &step("s1"), "socket connection refused")
        .await
        .unwrap();
    let state = snapshot.step(&step("s1")).unwrap();
    assert_eq!(state.status, StepStatus::Pending);
    assert_eq!(state.attempts, 1);
    assert!(state.not_before.is_some());

    let restarted = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(directive) = directives.recv().await {
            if let Directive::Started { step_id, .. } = &directive {
                if step_id == &step("s1") {
                    return true;
                }
            }
        }
        false
    })
    .await
    .expect("step restarted after backoff");
    assert!(restarted);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_appends_detect_one_conflict() {
    let (engine, _directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();
    let head = engine.store().head(&id).await.unwrap();

    let update = |key: &str| WorkflowEvent::ContextUpdated {
        updates: [(key.to_string(), json!(1))].into_iter().collect(),
        updated_at: TimestampUtc::now(),
    };
    let (first, second) = tokio::join!(
        engine.store().append(&id, update("a"), head, EventMetadata::default()),
        engine.store().append(&id, update("b"), head, EventMetadata::default()),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(WorkflowError::ConcurrencyConflict { .. })))
            .count(),
        1
    );
    assert_eq!(engine.store().head(&id).await.unwrap(), head + 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_false_condition_skips_step() {
    let (engine, _directives) = engine().await;
    let id = WorkflowId::from("w");
    let condition = Condition::Equals {
        key: "mode".to_string(),
        value: json!("full"),
    };
    let definition = WorkflowDefinition::new(
        "w",
        vec![
            WorkflowStepDefinition::new("inspect", StepType::Conditional { condition }),
            WorkflowStepDefinition::new("pack", StepType::Parallel),
        ],
    )
    .with_candidates(vec![AgentId::from("a1")]);
    engine.create(definition).await.unwrap();
    engine.start(&id).await.unwrap();

    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.step_status(&step("inspect")), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status(&step("pack")), Some(StepStatus::Running));

    engine.complete_step(&id, &step("pack"), json!(null)).await.unwrap();
    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.status(), WorkflowStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_loop_step_repeats_until_max_iterations() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    let definition = WorkflowDefinition::new(
        "w",
        vec![WorkflowStepDefinition::new(
            "polish",
            StepType::Loop {
                max_iterations: 3,
                until: None,
            },
        )],
    )
    .with_candidates(vec![AgentId::from("a1")]);
    engine.create(definition).await.unwrap();
    engine.start(&id).await.unwrap();

    for pass in 1..=3 {
        engine
            .complete_iteration(&id, &step("polish"), json!({ "pass": pass }))
            .await
            .unwrap();
    }

    let iterations: Vec<u32> = drain(&mut directives)
        .into_iter()
        .filter_map(|d| match d {
            Directive::Started { iteration, .. } => Some(iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iterations, vec![1, 2, 3]);

    let snapshot = engine.snapshot(&id).await.unwrap();
    let state = snapshot.step(&step("polish")).unwrap();
    assert_eq!(state.status, StepStatus::Completed);
    assert_eq!(state.result, Some(json!({ "pass": 3 })));
    assert_eq!(snapshot.status(), WorkflowStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_tells_running_agents_to_stop() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();
    drain(&mut directives);

    let snapshot = engine.cancel(&id, "line stopped").await.unwrap();
    assert_eq!(snapshot.status(), WorkflowStatus::Cancelled);

    let sent = drain(&mut directives);
    assert_eq!(
        sent,
        vec![Directive::Cancel {
            workflow_id: id.clone(),
            step_id: step("s1"),
            agent_id: Some(AgentId::from("a1")),
            reason: "line stopped".to_string(),
        }]
    );

    let err = engine.start(&id).await.unwrap_err();
    assert!(matches!(err.error, WorkflowError::InvalidTransition { .. }));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_sink_and_registered_handlers() {
    let sink = Arc::new(RecordingSink::default());
    let counter = Arc::new(CountingHandler::default());
    let (builder, _directives) = builder();
    let engine = builder
        .lifecycle_sink(sink.clone())
        .handler(EventKind::StepAssigned, counter.clone())
        .start()
        .await
        .unwrap();
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();

    let kinds: Vec<EventKind> = sink.events.lock().iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&EventKind::WorkflowCreated));
    assert!(kinds.contains(&EventKind::WorkflowActivated));
    assert!(kinds.contains(&EventKind::StepStarted));
    assert!(!kinds.contains(&EventKind::StepAssigned));
    assert_eq!(counter.seen.load(Ordering::SeqCst), 1);

    let started = sink
        .events
        .lock()
        .iter()
        .find(|e| e.kind == EventKind::StepStarted)
        .cloned()
        .unwrap();
    assert_eq!(started.component(), "Step");
    assert_eq!(started.step_id, Some(step("s1")));
    assert_eq!(started.status, WorkflowStatus::Active);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_workflow_timeout_fails_then_retries() {
    let (engine, _directives) = engine().await;
    let id = WorkflowId::from("w");
    let mut definition = sequential_definition("w");
    definition.timeout_ms = Some(10);
    engine.create(definition).await.unwrap();
    engine.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    engine.run_watchdog().await;

    let kinds = kinds(&engine, &id).await;
    assert!(kinds.contains(&EventKind::WorkflowFailed));
    assert!(kinds.contains(&EventKind::WorkflowRetried));
    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.attempt, 1);
    assert_eq!(snapshot.status(), WorkflowStatus::Active);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_strong_consistency_adopts_newer_cloud_copy() {
    let cloud = Arc::new(InMemoryCloud::new());
    let mut remote = ReplicaState::from_snapshot(&WorkflowSnapshot::created(
        sequential_definition("w"),
        TimestampUtc::now(),
    ));
    remote.version = 7;
    remote.timestamp = TimestampUtc::now().plus_millis(60_000);
    remote
        .state
        .global_context
        .insert("bin".to_string(), json!("B-7"));
    cloud.seed(remote.clone());

    let mut config = EngineConfig::default();
    config.consistency.level = ConsistencyLevel::Strong;
    let (builder, _directives) = builder();
    let engine = builder.config(config).transport(cloud.clone()).start().await.unwrap();

    let id = WorkflowId::from("w");
    let snapshot = engine.create(sequential_definition("w")).await.unwrap();
    assert_eq!(snapshot.global_context.get("bin"), Some(&json!("B-7")));
    assert!(kinds(&engine, &id).await.contains(&EventKind::ReplicaReconciled));
    assert_eq!(cloud.state(&id), Some(remote));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_reconcile_without_transport_is_rejected() {
    let (engine, _directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(sequential_definition("w")).await.unwrap();

    let rejected = engine.reconcile(&id).await.unwrap_err();
    assert!(matches!(rejected.error, WorkflowError::Validation { .. }));
    assert!(rejected.snapshot.is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_maintenance_retires_evicted_terminal_workflows() {
    let (builder, _directives) = builder();
    let mut config = EngineConfig::default();
    config.cache.hot_capacity = 1;
    config.cache.warm_capacity = 1;
    let engine = builder.config(config).start().await.unwrap();

    let done = WorkflowId::from("done");
    engine
        .create(single_step_definition("done", "arm-1", 5, StepConstraints::default()))
        .await
        .unwrap();
    engine.start(&done).await.unwrap();
    engine.complete_step(&done, &step("work"), json!(null)).await.unwrap();
    for id in ["b", "c"] {
        engine.create(sequential_definition(id)).await.unwrap();
    }

    assert_eq!(engine.maintain().await, 1);
    assert_eq!(engine.maintain().await, 0);
    assert_eq!(engine.cache().indexed_status(&done), None);
    assert!(!engine
        .cache()
        .workflows_with_status(WorkflowStatus::Completed)
        .contains(&done));

    let snapshot = engine.snapshot(&done).await.unwrap();
    assert_eq!(snapshot.status(), WorkflowStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_commands() {
    let (builder, _directives) = builder();
    let engine = builder.background_tasks(true).start().await.unwrap();
    engine.shutdown().await;

    let rejected = engine.create(sequential_definition("w")).await.unwrap_err();
    assert!(matches!(rejected.error, WorkflowError::Validation { .. }));
}
