use super::*;
use crate::domain::types::{
    AgentId, StepType, TimestampUtc, WorkflowDefinition, WorkflowId, WorkflowStepDefinition,
};
use crate::domain::WorkflowAggregate;
use crate::event_store::InMemoryBackend;
use crate::test_support::{drive, sequential_definition, step};

fn manager(config: RecoveryConfig) -> RecoveryManager {
    RecoveryManager::new(config, Arc::new(InMemoryBackend::new()))
}

async fn created(definition: WorkflowDefinition) -> WorkflowAggregate {
    let mut aggregate = WorkflowAggregate::default();
    drive(
        &mut aggregate,
        vec![
            WorkflowCommand::CreateWorkflow { definition },
            WorkflowCommand::Activate,
        ],
    )
    .await;
    aggregate
}

fn snapshot_of(aggregate: &WorkflowAggregate) -> WorkflowSnapshot {
    aggregate.snapshot().expect("initialized").clone()
}

/// `s1` completed, `s2` failed, `s3` pending.
async fn fail_second_step(aggregate: &mut WorkflowAggregate) {
    drive(
        aggregate,
        vec![
            WorkflowCommand::StartStep { step_id: step("s1") },
            WorkflowCommand::CompleteStep {
                step_id: step("s1"),
                result: serde_json::json!({"picked": 4}),
            },
            WorkflowCommand::StartStep { step_id: step("s2") },
            WorkflowCommand::FailStep {
                step_id: step("s2"),
                error: "arm-2 stopped responding".to_string(),
            },
        ],
    )
    .await;
}

fn agent_failure(workflow: &str, step_id: &str) -> FailureSignal {
    FailureSignal::new(
        WorkflowId::from(workflow),
        FailureKind::AgentFailure,
        "arm-2 stopped responding",
    )
    .for_step(step(step_id))
}

#[tokio::test]
async fn test_agent_failure_restores_checkpoint() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-d")).await;
    let checkpoint = recovery
        .checkpoint(&snapshot_of(&aggregate), "activated")
        .await
        .unwrap();
    fail_second_step(&mut aggregate).await;

    let plan = recovery
        .plan(&snapshot_of(&aggregate), agent_failure("wf-d", "s2"))
        .await
        .unwrap();
    assert_eq!(plan.severity, 5);
    assert_eq!(plan.strategy, RecoveryStrategy::CheckpointRestore);
    assert_eq!(plan.checkpoint_id, Some(checkpoint.id));
    assert_eq!(plan.complexity, Some(2));
    assert!(matches!(
        plan.commands[0],
        WorkflowCommand::InitiateRecovery { severity: 5, .. }
    ));

    drive(&mut aggregate, plan.commands).await;
    let restored = snapshot_of(&aggregate);
    assert_eq!(restored.execution_state(), checkpoint.state);
    assert_eq!(restored.recoveries, 1);
    assert_eq!(restored.last_checkpoint, Some(checkpoint.id));
}

#[tokio::test]
async fn test_restore_rewinds_steps_running_at_capture() {
    let definition = WorkflowDefinition::new(
        "wf-p",
        vec![
            WorkflowStepDefinition::new("p1", StepType::Parallel),
            WorkflowStepDefinition::new("p2", StepType::Parallel),
        ],
    );
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(definition).await;
    drive(
        &mut aggregate,
        vec![
            WorkflowCommand::AssignStep {
                step_id: step("p2"),
                agent_id: AgentId::from("a1"),
            },
            WorkflowCommand::StartStep { step_id: step("p1") },
            WorkflowCommand::StartStep { step_id: step("p2") },
            WorkflowCommand::CompleteStep {
                step_id: step("p1"),
                result: serde_json::json!("done"),
            },
        ],
    )
    .await;
    let checkpoint = recovery
        .checkpoint(&snapshot_of(&aggregate), "completed p1")
        .await
        .unwrap();
    assert_eq!(
        checkpoint.state.steps[&step("p2")].status,
        StepStatus::Running
    );
    drive(
        &mut aggregate,
        vec![WorkflowCommand::FailStep {
            step_id: step("p2"),
            error: "gripper jammed".to_string(),
        }],
    )
    .await;

    let plan = recovery
        .plan(&snapshot_of(&aggregate), agent_failure("wf-p", "p2"))
        .await
        .unwrap();
    assert_eq!(plan.strategy, RecoveryStrategy::CheckpointRestore);

    drive(&mut aggregate, plan.commands).await;
    let restored = snapshot_of(&aggregate);
    assert_eq!(restored.step_status(&step("p1")), Some(StepStatus::Completed));
    assert_eq!(restored.step_status(&step("p2")), Some(StepStatus::Pending));
    assert!(restored.step(&step("p2")).unwrap().started_at.is_none());
    assert!(!restored.assigned_agents.contains_key(&step("p2")));
    assert_eq!(restored.running_steps().count(), 0);
}

#[tokio::test]
async fn test_low_severity_retries_with_backoff() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-r")).await;
    fail_second_step(&mut aggregate).await;

    let failure = FailureSignal::new(WorkflowId::from("wf-r"), FailureKind::Network, "ECONNRESET")
        .for_step(step("s2"));
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert_eq!(plan.band, RecoveryStrategy::Retry);
    assert!(matches!(
        &plan.commands[1],
        WorkflowCommand::RetryStep { backoff_ms: 100, .. }
    ));

    drive(&mut aggregate, plan.commands).await;
    let snapshot = snapshot_of(&aggregate);
    let s2 = snapshot.step(&step("s2")).unwrap();
    assert_eq!(s2.status, StepStatus::Pending);
    assert_eq!(s2.attempts, 1);
    assert!(s2.not_before.is_some());
}

#[tokio::test]
async fn test_retry_of_running_step_fails_it_first() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-t")).await;
    drive(
        &mut aggregate,
        vec![WorkflowCommand::StartStep { step_id: step("s1") }],
    )
    .await;

    let failure = FailureSignal::new(WorkflowId::from("wf-t"), FailureKind::Timeout, "no heartbeat")
        .for_step(step("s1"));
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert_eq!(plan.commands.len(), 3);
    assert!(matches!(plan.commands[1], WorkflowCommand::FailStep { .. }));
    assert!(matches!(plan.commands[2], WorkflowCommand::RetryStep { .. }));
    drive(&mut aggregate, plan.commands).await;
    assert_eq!(
        snapshot_of(&aggregate).step_status(&step("s1")),
        Some(StepStatus::Pending)
    );
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_workflow() {
    let recovery = manager(RecoveryConfig::default());
    let mut definition = sequential_definition("wf-x");
    definition.retry_policy.max_retries = 0;
    let mut aggregate = created(definition).await;
    fail_second_step(&mut aggregate).await;

    let failure = FailureSignal::new(WorkflowId::from("wf-x"), FailureKind::Network, "ECONNRESET")
        .for_step(step("s2"));
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert!(matches!(plan.commands[1], WorkflowCommand::Fail { .. }));
    drive(&mut aggregate, plan.commands).await;
    assert_eq!(snapshot_of(&aggregate).status(), WorkflowStatus::Failed);

    let failure = FailureSignal::new(WorkflowId::from("wf-x"), FailureKind::Unknown, "retry");
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert!(plan.is_audit_only());
}

#[tokio::test]
async fn test_failed_workflow_is_retried_while_budget_remains() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-f")).await;
    drive(
        &mut aggregate,
        vec![WorkflowCommand::Fail {
            reason: "operator abort".to_string(),
        }],
    )
    .await;

    let failure = FailureSignal::new(WorkflowId::from("wf-f"), FailureKind::Unknown, "retry");
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert!(matches!(plan.commands[1], WorkflowCommand::RetryWorkflow));
    drive(&mut aggregate, plan.commands).await;
    assert_eq!(snapshot_of(&aggregate).status(), WorkflowStatus::Pending);
}

#[tokio::test]
async fn test_missing_checkpoint_degrades_to_retry() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-n")).await;
    fail_second_step(&mut aggregate).await;

    let plan = recovery
        .plan(&snapshot_of(&aggregate), agent_failure("wf-n", "s2"))
        .await
        .unwrap();
    assert_eq!(plan.band, RecoveryStrategy::CheckpointRestore);
    assert_eq!(plan.strategy, RecoveryStrategy::Retry);
    assert!(plan.checkpoint_id.is_none());
}

#[tokio::test]
async fn test_complex_restore_becomes_partial_rollback() {
    let config = RecoveryConfig {
        restore_complexity_limit: 1,
        ..RecoveryConfig::default()
    };
    let recovery = manager(config);
    let mut aggregate = created(sequential_definition("wf-c")).await;
    recovery
        .checkpoint(&snapshot_of(&aggregate), "activated")
        .await
        .unwrap();
    fail_second_step(&mut aggregate).await;

    let plan = recovery
        .plan(&snapshot_of(&aggregate), agent_failure("wf-c", "s2"))
        .await
        .unwrap();
    assert_eq!(plan.strategy, RecoveryStrategy::PartialRollback);
    let WorkflowCommand::ApplyPartialRollback { steps, .. } = &plan.commands[1] else {
        panic!("expected partial rollback");
    };
    assert_eq!(
        steps.keys().cloned().collect::<Vec<_>>(),
        vec![step("s2"), step("s3")]
    );

    drive(&mut aggregate, plan.commands).await;
    let snapshot = snapshot_of(&aggregate);
    assert_eq!(snapshot.step_status(&step("s1")), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status(&step("s2")), Some(StepStatus::Pending));
}

#[tokio::test]
async fn test_rollback_keeps_independent_branches() {
    let definition = WorkflowDefinition::new(
        "wf-b",
        vec![
            WorkflowStepDefinition::new("scan", StepType::Parallel),
            WorkflowStepDefinition::new("pick", StepType::Parallel),
            WorkflowStepDefinition::new("pack", StepType::Parallel).depending_on("pick"),
        ],
    );
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(definition).await;
    recovery
        .checkpoint(&snapshot_of(&aggregate), "activated")
        .await
        .unwrap();
    drive(
        &mut aggregate,
        vec![
            WorkflowCommand::StartStep { step_id: step("scan") },
            WorkflowCommand::CompleteStep {
                step_id: step("scan"),
                result: serde_json::json!("ok"),
            },
            WorkflowCommand::StartStep { step_id: step("pick") },
            WorkflowCommand::FailStep {
                step_id: step("pick"),
                error: "checksum mismatch on tray".to_string(),
            },
        ],
    )
    .await;

    let failure = FailureSignal::new(
        WorkflowId::from("wf-b"),
        FailureKind::DataCorruption,
        "checksum mismatch on tray",
    )
    .for_step(step("pick"));
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert_eq!(plan.severity, 7);
    assert_eq!(plan.strategy, RecoveryStrategy::PartialRollback);

    drive(&mut aggregate, plan.commands).await;
    let snapshot = snapshot_of(&aggregate);
    assert_eq!(snapshot.step_status(&step("scan")), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status(&step("pick")), Some(StepStatus::Pending));
    assert_eq!(snapshot.step_status(&step("pack")), Some(StepStatus::Pending));
}

#[tokio::test]
async fn test_safety_violation_parks_the_workflow() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-s")).await;
    let failure = FailureSignal::new(
        WorkflowId::from("wf-s"),
        FailureKind::SafetyViolation,
        "light curtain breached",
    );
    let plan = recovery.plan(&snapshot_of(&aggregate), failure).await.unwrap();
    assert_eq!(plan.strategy, RecoveryStrategy::ManualIntervention);
    drive(&mut aggregate, plan.commands).await;
    assert!(snapshot_of(&aggregate).phase.is_parked());

    let again = FailureSignal::new(WorkflowId::from("wf-s"), FailureKind::Timeout, "late");
    let plan = recovery.plan(&snapshot_of(&aggregate), again).await.unwrap();
    assert!(plan.is_audit_only());
}

#[tokio::test]
async fn test_corrupt_checkpoint_escalates() {
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(sequential_definition("wf-k")).await;
    let mut checkpoint = RecoveryCheckpoint::capture(&snapshot_of(&aggregate), "activated", BTreeMap::new());
    checkpoint.sequence += 7;
    recovery.checkpoints().save(&checkpoint).await.unwrap();
    fail_second_step(&mut aggregate).await;

    let plan = recovery
        .plan(&snapshot_of(&aggregate), agent_failure("wf-k", "s2"))
        .await
        .unwrap();
    assert_eq!(plan.strategy, RecoveryStrategy::ManualIntervention);
    assert!(matches!(
        &plan.commands[1],
        WorkflowCommand::EscalateToManual { reason } if reason.contains("data corruption")
            || reason.contains("corrupt")
    ));
}

#[tokio::test]
async fn test_severity_override_and_clamp() {
    let recovery = manager(RecoveryConfig::default());
    let signal = FailureSignal::new(WorkflowId::from("w"), FailureKind::Network, "x");
    assert_eq!(recovery.severity(&signal), 2);
    assert_eq!(recovery.severity(&signal.clone().with_severity(8)), 8);
    assert_eq!(recovery.severity(&signal.clone().with_severity(0)), 1);
    assert_eq!(recovery.severity(&signal.with_severity(42)), 10);
}

#[tokio::test]
async fn test_checkpoints_are_write_once_and_persisted() {
    let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
    let store = CheckpointStore::new(backend.clone(), 2);
    let aggregate = created(sequential_definition("wf-p")).await;
    let snapshot = snapshot_of(&aggregate);

    let first = RecoveryCheckpoint::capture(&snapshot, "a", BTreeMap::new());
    store.save(&first).await.unwrap();
    let err = store.save(&first).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { .. }));

    let second = RecoveryCheckpoint::capture(&snapshot, "b", BTreeMap::new());
    let third = RecoveryCheckpoint::capture(&snapshot, "c", BTreeMap::new());
    store.save(&second).await.unwrap();
    store.save(&third).await.unwrap();
    let kept = store.list(&snapshot.workflow_id).await.unwrap();
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].id, second.id);

    let reopened = CheckpointStore::new(backend, 2);
    let latest = reopened.latest(&snapshot.workflow_id).await.unwrap().unwrap();
    assert_eq!(latest, third);
    assert!(latest.verify().is_ok());
    assert!(reopened
        .get(&snapshot.workflow_id, first.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_checkpoint_records_resource_allocations() {
    let mut definition = sequential_definition("wf-a");
    definition.steps[0].constraints.resources = vec!["dock-2".to_string()];
    let recovery = manager(RecoveryConfig::default());
    let mut aggregate = created(definition).await;
    drive(
        &mut aggregate,
        vec![
            WorkflowCommand::AssignStep {
                step_id: step("s1"),
                agent_id: "a1".into(),
            },
            WorkflowCommand::StartStep { step_id: step("s1") },
        ],
    )
    .await;

    let checkpoint = recovery
        .checkpoint(&snapshot_of(&aggregate), "step_started")
        .await
        .unwrap();
    assert_eq!(
        checkpoint.resource_allocations.get("dock-2"),
        Some(&step("s1"))
    );
    assert_eq!(checkpoint.agent_states[&AgentId::from("a1")]["step"], "s1");
}

#[test]
fn test_dependent_closure_follows_implicit_order() {
    let snapshot = WorkflowSnapshot::created(sequential_definition("w"), TimestampUtc::now());
    let closure = dependent_closure(&snapshot, &step("s1"));
    assert_eq!(closure.len(), 3);
    let closure = dependent_closure(&snapshot, &step("s3"));
    assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![step("s3")]);
}
