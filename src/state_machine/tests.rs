//! Tests for the workflow and step transition tables.

use super::*;
use proptest::prelude::*;

const SUBSTATES: [ActiveSubstate; 5] = [
    ActiveSubstate::Initializing,
    ActiveSubstate::Executing,
    ActiveSubstate::Waiting,
    ActiveSubstate::Synchronizing,
    ActiveSubstate::Finalizing,
];

fn all_phases() -> Vec<WorkflowPhase> {
    let mut phases = vec![
        WorkflowPhase::Pending,
        WorkflowPhase::Completed,
        WorkflowPhase::Failed,
        WorkflowPhase::Cancelled,
    ];
    for substate in SUBSTATES {
        phases.push(WorkflowPhase::Active { substate });
        phases.push(WorkflowPhase::Paused {
            resume_to: substate,
            parked: false,
        });
        phases.push(WorkflowPhase::Paused {
            resume_to: substate,
            parked: true,
        });
    }
    phases
}

#[test]
fn test_happy_path_through_substates() {
    let mut phase = WorkflowPhase::Pending;
    for trigger in [
        WorkflowTrigger::Activate,
        WorkflowTrigger::Execute,
        WorkflowTrigger::Synchronize,
        WorkflowTrigger::Execute,
        WorkflowTrigger::Wait,
        WorkflowTrigger::Execute,
        WorkflowTrigger::Finalize,
        WorkflowTrigger::Complete,
    ] {
        phase = transition(phase, trigger).expect("transition allowed");
    }
    assert_eq!(phase, WorkflowPhase::Completed);
}

#[test]
fn test_replica_phase_must_be_one_edge_away() {
    let active = WorkflowPhase::Active {
        substate: ActiveSubstate::Executing,
    };
    let waiting = WorkflowPhase::Active {
        substate: ActiveSubstate::Synchronizing,
    };
    let paused = WorkflowPhase::Paused {
        resume_to: ActiveSubstate::Executing,
        parked: false,
    };
    let parked = WorkflowPhase::Paused {
        resume_to: ActiveSubstate::Executing,
        parked: true,
    };

    assert!(replica_transition(active, waiting).is_ok());
    assert!(replica_transition(active, paused).is_ok());
    assert!(replica_transition(paused, active).is_ok());
    assert!(replica_transition(active, WorkflowPhase::Failed).is_ok());
    assert!(replica_transition(WorkflowPhase::Pending, WorkflowPhase::Pending).is_ok());

    assert!(replica_transition(WorkflowPhase::Pending, paused).is_err());
    assert!(replica_transition(parked, paused).is_err());
    assert!(replica_transition(active, WorkflowPhase::Completed).is_err());
    assert!(replica_transition(WorkflowPhase::Failed, active).is_err());
}

#[test]
fn test_pause_returns_to_previous_substate() {
    let active = WorkflowPhase::Active {
        substate: ActiveSubstate::Synchronizing,
    };
    let paused = transition(active, WorkflowTrigger::Pause).expect("pause");
    assert_eq!(paused.status(), WorkflowStatus::Paused);
    assert_eq!(transition(paused, WorkflowTrigger::Resume).expect("resume"), active);
}

#[test]
fn test_parked_workflow_requires_manual_resolution() {
    let active = WorkflowPhase::Active {
        substate: ActiveSubstate::Executing,
    };
    let parked = transition(active, WorkflowTrigger::Escalate).expect("escalate");
    assert!(parked.is_parked());

    let err = transition(parked, WorkflowTrigger::Resume).expect_err("plain resume rejected");
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

    assert_eq!(
        transition(parked, WorkflowTrigger::ResolveManually).expect("resolve"),
        active
    );
}

#[test]
fn test_failed_only_leaves_via_retry() {
    for trigger in WorkflowTrigger::ALL {
        let result = transition(WorkflowPhase::Failed, trigger);
        if trigger == WorkflowTrigger::Retry {
            assert_eq!(result.expect("retry back-edge"), WorkflowPhase::Pending);
        } else {
            assert!(result.is_err(), "failed + {trigger:?} should be rejected");
        }
    }
}

#[test]
fn test_terminal_states_reject_everything() {
    for phase in [WorkflowPhase::Completed, WorkflowPhase::Cancelled] {
        for trigger in WorkflowTrigger::ALL {
            assert!(transition(phase, trigger).is_err());
        }
    }
}

#[test]
fn test_rejection_names_state_and_trigger() {
    let err = transition(WorkflowPhase::Pending, WorkflowTrigger::Complete).expect_err("rejected");
    assert_eq!(
        err,
        WorkflowError::InvalidTransition {
            state: "PENDING".to_string(),
            trigger: "complete".to_string(),
        }
    );
}

#[test]
fn test_table_size_is_stable() {
    let allowed = all_phases()
        .into_iter()
        .flat_map(|phase| WorkflowTrigger::ALL.map(|trigger| (phase, trigger)))
        .filter(|(phase, trigger)| transition(*phase, *trigger).is_ok())
        .count();
    // 1 activate, 3 execute, 2 wait, 2 synchronize, 3 finalize, 1 complete,
    // 5 pause, 5 resume, 15 escalate, 5 resolve, 15 fail, 16 cancel, 1 retry
    assert_eq!(allowed, 74);
}

#[test]
fn test_step_machine() {
    let running = step_transition(StepStatus::Pending, StepTrigger::Start).expect("start");
    assert_eq!(running, StepStatus::Running);
    assert_eq!(
        step_transition(running, StepTrigger::Iterate).expect("iterate"),
        StepStatus::Running
    );
    assert_eq!(
        step_transition(running, StepTrigger::Complete).expect("complete"),
        StepStatus::Completed
    );
    assert!(step_transition(StepStatus::Completed, StepTrigger::Start).is_err());
    assert!(step_transition(StepStatus::Pending, StepTrigger::Complete).is_err());
    assert_eq!(
        step_transition(StepStatus::Failed, StepTrigger::Retry).expect("retry"),
        StepStatus::Pending
    );
    assert!(step_transition(StepStatus::Completed, StepTrigger::Preempt).is_err());
}

fn any_trigger() -> impl Strategy<Value = WorkflowTrigger> {
    (0..WorkflowTrigger::ALL.len()).prop_map(|i| WorkflowTrigger::ALL[i])
}

proptest! {
    #[test]
    fn prop_terminal_states_are_absorbing(triggers in prop::collection::vec(any_trigger(), 0..40)) {
        let mut phase = WorkflowPhase::Pending;
        let mut terminal_seen: Option<WorkflowPhase> = None;
        for trigger in triggers {
            match transition(phase, trigger) {
                Ok(next) => {
                    prop_assert!(terminal_seen.is_none(), "left terminal state via {:?}", trigger);
                    phase = next;
                    if phase.status().is_terminal() {
                        terminal_seen = Some(phase);
                    }
                }
                Err(err) => {
                    let is_invalid_transition = matches!(err, WorkflowError::InvalidTransition { .. });
                    prop_assert!(is_invalid_transition);
                }
            }
        }
    }
}
