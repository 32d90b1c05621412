use super::*;
use crate::coordination::ProceedRole;

#[tokio::test]
async fn test_synchronization_step_releases_when_all_arrive() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    let definition = WorkflowDefinition::new(
        "w",
        vec![
            WorkflowStepDefinition::new("meet", StepType::Synchronization { required_agents: 2 }),
            WorkflowStepDefinition::new("after", StepType::Parallel).depending_on("meet"),
        ],
    )
    .with_candidates(vec![AgentId::from("a1"), AgentId::from("a2")]);
    engine.create(definition).await.unwrap();

    let snapshot = engine.start(&id).await.unwrap().snapshot().clone();
    assert_eq!(snapshot.substate(), Some(crate::domain::types::ActiveSubstate::Synchronizing));
    assert!(engine.coordinator().point(&point_id(&id, &step("meet"))).is_some());
    drain(&mut directives);

    let first = engine
        .arrive(&id, &step("meet"), &AgentId::from("a1"))
        .await
        .unwrap();
    let Arrival::Waiting(wait) = first else {
        panic!("first arrival must wait");
    };
    let second = engine
        .arrive(&id, &step("meet"), &AgentId::from("a2"))
        .await
        .unwrap();
    assert!(second.is_released());

    let release = tokio::time::timeout(Duration::from_secs(2), wait.wait())
        .await
        .expect("barrier releases")
        .unwrap();
    assert_eq!(release.participants.len(), 2);
    assert_eq!(
        release.directive_for(&AgentId::from("a1")).map(|d| &d.role),
        Some(&ProceedRole::Leader)
    );

    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.step_status(&step("meet")), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status(&step("after")), Some(StepStatus::Running));
    assert_eq!(snapshot.substate(), Some(crate::domain::types::ActiveSubstate::Executing));

    let proceeds = drain(&mut directives)
        .into_iter()
        .filter(|d| matches!(d, Directive::Proceed { .. }))
        .count();
    assert_eq!(proceeds, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_conflict_scan_preempts_lower_priority_workflow() {
    let (engine, mut directives) = engine().await;
    let zone = StepConstraints {
        zone: Some("cell-4".to_string()),
        ..StepConstraints::default()
    };
    let high = WorkflowId::from("high");
    let low = WorkflowId::from("low");
    engine
        .create(single_step_definition("high", "arm-1", 9, zone.clone()))
        .await
        .unwrap();
    engine
        .create(single_step_definition("low", "arm-2", 3, zone))
        .await
        .unwrap();
    engine.start(&high).await.unwrap();
    engine.start(&low).await.unwrap();
    drain(&mut directives);

    let outcomes = engine.scan_conflicts().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], ConflictOutcome::Resolved { .. }));

    let low_snapshot = engine.snapshot(&low).await.unwrap();
    let state = low_snapshot.step(&step("work")).unwrap();
    assert_eq!(state.status, StepStatus::Pending);
    assert!(state.avoided_agents.contains(&AgentId::from("arm-2")));
    let high_snapshot = engine.snapshot(&high).await.unwrap();
    assert_eq!(high_snapshot.step_status(&step("work")), Some(StepStatus::Running));

    let sent = drain(&mut directives);
    assert!(sent.iter().any(|d| matches!(
        d,
        Directive::Cancel { workflow_id, agent_id: Some(agent), .. }
            if workflow_id == &low && agent == &AgentId::from("arm-2")
    )));
    assert!(engine.scan_conflicts().await.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_preempted_step_resumes_once_contention_ends() {
    let (engine, mut directives) = engine().await;
    let zone = StepConstraints {
        zone: Some("cell-4".to_string()),
        ..StepConstraints::default()
    };
    let high = WorkflowId::from("high");
    let low = WorkflowId::from("low");
    engine
        .create(single_step_definition("high", "arm-1", 9, zone.clone()))
        .await
        .unwrap();
    engine
        .create(single_step_definition("low", "arm-2", 3, zone))
        .await
        .unwrap();
    engine.start(&high).await.unwrap();
    engine.start(&low).await.unwrap();
    assert_eq!(engine.scan_conflicts().await.len(), 1);
    assert_eq!(
        engine.snapshot(&low).await.unwrap().step_status(&step("work")),
        Some(StepStatus::Pending)
    );
    drain(&mut directives);

    engine.complete_step(&high, &step("work"), json!(null)).await.unwrap();
    assert_eq!(
        engine.snapshot(&high).await.unwrap().status(),
        WorkflowStatus::Completed
    );

    let low_snapshot = engine.snapshot(&low).await.unwrap();
    let state = low_snapshot.step(&step("work")).unwrap();
    assert_eq!(state.status, StepStatus::Running);
    assert!(state.avoided_agents.is_empty());
    assert_eq!(
        low_snapshot.assigned_agents.get(&step("work")),
        Some(&AgentId::from("arm-2"))
    );
    let sent = drain(&mut directives);
    assert!(sent.iter().any(|d| matches!(
        d,
        Directive::Started { workflow_id, agent_id: Some(agent), .. }
            if workflow_id == &low && agent == &AgentId::from("arm-2")
    )));
    assert!(engine.scan_conflicts().await.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_barrier_arrivals_wait_for_resume() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(barrier_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();
    engine.pause(&id, "operator").await.unwrap();
    drain(&mut directives);

    let rejected = engine
        .arrive(&id, &step("meet"), &AgentId::from("a1"))
        .await
        .unwrap_err();
    assert!(matches!(rejected.error, WorkflowError::InvalidTransition { .. }));
    assert!(drain(&mut directives)
        .iter()
        .all(|d| !matches!(d, Directive::Proceed { .. })));

    engine.resume(&id).await.unwrap();
    engine.arrive(&id, &step("meet"), &AgentId::from("a1")).await.unwrap();
    let second = engine
        .arrive(&id, &step("meet"), &AgentId::from("a2"))
        .await
        .unwrap();
    assert!(second.is_released());
    let snapshot = engine.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.step_status(&step("meet")), Some(StepStatus::Completed));
    let proceeds = drain(&mut directives)
        .into_iter()
        .filter(|d| matches!(d, Directive::Proceed { .. }))
        .count();
    assert_eq!(proceeds, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_uncommitted_barrier_release_sends_no_proceed() {
    let (engine, mut directives) = engine().await;
    let id = WorkflowId::from("w");
    engine.create(barrier_definition("w")).await.unwrap();
    engine.start(&id).await.unwrap();
    engine
        .complete_step(&id, &step("meet"), json!("settled elsewhere"))
        .await
        .unwrap();
    drain(&mut directives);

    engine.arrive(&id, &step("meet"), &AgentId::from("a1")).await.unwrap();
    let rejected = engine
        .arrive(&id, &step("meet"), &AgentId::from("a2"))
        .await
        .unwrap_err();
    assert!(matches!(rejected.error, WorkflowError::InvalidTransition { .. }));

    assert!(drain(&mut directives)
        .iter()
        .all(|d| !matches!(d, Directive::Proceed { .. })));
    assert!(engine.coordinator().point(&point_id(&id, &step("meet"))).is_none());
    assert_eq!(
        engine.snapshot(&id).await.unwrap().step_status(&step("meet")),
        Some(StepStatus::Completed)
    );

    engine.shutdown().await;
}

/// Two-agent barrier followed by one parallel step.
fn barrier_definition(id: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(
        id,
        vec![
            WorkflowStepDefinition::new("meet", StepType::Synchronization { required_agents: 2 }),
            WorkflowStepDefinition::new("after", StepType::Parallel).depending_on("meet"),
        ],
    )
    .with_candidates(vec![AgentId::from("a1"), AgentId::from("a2")])
}

#[tokio::test]
async fn test_watchdog_reports_stalled_barrier() {
    let (builder, _directives) = builder();
    let mut config = EngineConfig::default();
    config.coordination.stall_timeout_ms = 5;
    let engine = builder.config(config).start().await.unwrap();
    let id = WorkflowId::from("w");
    let definition = WorkflowDefinition::new(
        "w",
        vec![WorkflowStepDefinition::new(
            "meet",
            StepType::Synchronization { required_agents: 2 },
        )],
    );
    engine.create(definition).await.unwrap();
    engine.start(&id).await.unwrap();
    let _waiting = engine
        .arrive(&id, &step("meet"), &AgentId::from("a1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.run_watchdog().await;

    let events = engine.events(&id).await.unwrap();
    let failure = events
        .iter()
        .find_map(|record| match &record.event {
            WorkflowEvent::RecoveryInitiated { failure, .. } => Some(failure.clone()),
            _ => None,
        })
        .expect("stall routed to recovery");
    assert_eq!(failure.kind, FailureKind::CoordinationTimeout);
    assert_eq!(failure.step_id, Some(step("meet")));

    engine.shutdown().await;
}
