//! CQRS core types for event sourcing.
//!
//! - **Commands**: intent to change state
//! - **Events**: facts that have happened
//! - **Aggregate**: command validation and event application
//! - **Query**: write-through projection into the state cache

pub mod commands;
pub mod events;
pub mod query;

pub use commands::WorkflowCommand;
pub use events::{EventKind, WorkflowEvent};
pub use query::SnapshotProjection;

use crate::domain::errors::WorkflowError;
use crate::domain::services::WorkflowServices;
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::{
    StepId, StepStatus, StepType, TimestampUtc, WorkflowDefinition, WorkflowStatus,
};
use crate::state_machine::{
    replica_transition, step_transition, transition, StepTrigger, WorkflowTrigger,
};
use async_trait::async_trait;
use cqrs_es::Aggregate;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Aggregate lifecycle: nothing recorded yet, or a materialized snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum WorkflowState {
    #[default]
    Uninitialized,
    Active(Box<WorkflowSnapshot>),
}

/// Event-sourced workflow aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAggregate {
    state: WorkflowState,
}

impl WorkflowAggregate {
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn snapshot(&self) -> Option<&WorkflowSnapshot> {
        match &self.state {
            WorkflowState::Uninitialized => None,
            WorkflowState::Active(snapshot) => Some(snapshot),
        }
    }

    pub fn into_snapshot(self) -> Option<WorkflowSnapshot> {
        match self.state {
            WorkflowState::Uninitialized => None,
            WorkflowState::Active(snapshot) => Some(*snapshot),
        }
    }

    /// Resumes from a stored snapshot.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        Self {
            state: WorkflowState::Active(Box::new(snapshot)),
        }
    }

    /// Sequence of the last applied event (0 when uninitialized).
    pub fn sequence(&self) -> u64 {
        self.snapshot().map_or(0, |snapshot| snapshot.sequence)
    }
}

#[async_trait]
impl Aggregate for WorkflowAggregate {
    type Command = WorkflowCommand;
    type Event = WorkflowEvent;
    type Error = WorkflowError;
    type Services = WorkflowServices;

    fn aggregate_type() -> String {
        "workflow".to_string()
    }

    async fn handle(
        &self,
        command: Self::Command,
        services: &Self::Services,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        let now = services.clock.now();
        match &self.state {
            WorkflowState::Uninitialized => match command {
                WorkflowCommand::CreateWorkflow { definition } => {
                    validate_definition(&definition)?;
                    Ok(vec![WorkflowEvent::WorkflowCreated {
                        definition,
                        created_at: now,
                    }])
                }
                _ => Err(WorkflowError::NotInitialized),
            },
            WorkflowState::Active(snapshot) => decide(snapshot, command, now),
        }
    }

    fn apply(&mut self, event: Self::Event) {
        if let WorkflowState::Active(snapshot) = &mut self.state {
            snapshot.apply(&event);
            return;
        }
        if let WorkflowEvent::WorkflowCreated {
            definition,
            created_at,
        } = event
        {
            self.state =
                WorkflowState::Active(Box::new(WorkflowSnapshot::created(definition, created_at)));
        }
    }
}

/// Validates a command against the current snapshot and emits events.
fn decide(
    snapshot: &WorkflowSnapshot,
    command: WorkflowCommand,
    now: TimestampUtc,
) -> Result<Vec<WorkflowEvent>, WorkflowError> {
    let status = snapshot.status();
    if status == WorkflowStatus::Cancelled && !command.is_compensating() {
        return Err(WorkflowError::Cancelled(snapshot.workflow_id.clone()));
    }

    let event = match command {
        WorkflowCommand::CreateWorkflow { .. } => {
            return Err(WorkflowError::validation(format!(
                "workflow {} already exists",
                snapshot.workflow_id
            )));
        }
        WorkflowCommand::Activate => {
            transition(snapshot.phase, WorkflowTrigger::Activate)?;
            WorkflowEvent::WorkflowActivated { activated_at: now }
        }
        WorkflowCommand::ChangeSubstate { trigger } => {
            if !matches!(
                trigger,
                WorkflowTrigger::Execute
                    | WorkflowTrigger::Wait
                    | WorkflowTrigger::Synchronize
                    | WorkflowTrigger::Finalize
            ) {
                return Err(WorkflowError::validation(format!(
                    "'{}' is not a substate trigger",
                    trigger.name()
                )));
            }
            let next = transition(snapshot.phase, trigger)?;
            let substate = next.substate().ok_or_else(|| {
                WorkflowError::validation("substate trigger left the ACTIVE state")
            })?;
            WorkflowEvent::SubstateChanged {
                trigger,
                substate,
                changed_at: now,
            }
        }
        WorkflowCommand::Pause { reason } => {
            transition(snapshot.phase, WorkflowTrigger::Pause)?;
            WorkflowEvent::WorkflowPaused {
                reason,
                paused_at: now,
            }
        }
        WorkflowCommand::Resume => {
            transition(snapshot.phase, WorkflowTrigger::Resume)?;
            WorkflowEvent::WorkflowResumed { resumed_at: now }
        }
        WorkflowCommand::Complete => {
            transition(snapshot.phase, WorkflowTrigger::Complete)?;
            if !snapshot.all_steps_done() {
                return Err(WorkflowError::validation(
                    "cannot complete while steps are outstanding",
                ));
            }
            WorkflowEvent::WorkflowCompleted { completed_at: now }
        }
        WorkflowCommand::Fail { reason } => {
            transition(snapshot.phase, WorkflowTrigger::Fail)?;
            WorkflowEvent::WorkflowFailed {
                reason,
                failed_at: now,
            }
        }
        WorkflowCommand::Cancel { reason } => {
            transition(snapshot.phase, WorkflowTrigger::Cancel)?;
            WorkflowEvent::WorkflowCancelled {
                reason,
                cancelled_at: now,
            }
        }
        WorkflowCommand::RetryWorkflow => {
            transition(snapshot.phase, WorkflowTrigger::Retry)?;
            WorkflowEvent::WorkflowRetried {
                attempt: snapshot.attempt + 1,
                retried_at: now,
            }
        }

        WorkflowCommand::AssignStep { step_id, agent_id } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            if step.status != StepStatus::Pending {
                return Err(WorkflowError::validation(format!(
                    "step {step_id} must be pending to be assigned"
                )));
            }
            WorkflowEvent::StepAssigned {
                step_id,
                agent_id,
                assigned_at: now,
            }
        }
        WorkflowCommand::StartStep { step_id } => {
            if status != WorkflowStatus::Active {
                return Err(WorkflowError::InvalidTransition {
                    state: snapshot.phase.to_string(),
                    trigger: "start_step".to_string(),
                });
            }
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Start)?;
            if !snapshot.dependencies_done(&step_id) {
                return Err(WorkflowError::validation(format!(
                    "step {step_id} has unfinished dependencies"
                )));
            }
            WorkflowEvent::StepStarted {
                step_id,
                started_at: now,
            }
        }
        WorkflowCommand::CompleteIteration { step_id, output } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Iterate)?;
            let is_loop = snapshot
                .definition
                .step(&step_id)
                .is_some_and(|def| matches!(def.step_type, StepType::Loop { .. }));
            if !is_loop {
                return Err(WorkflowError::validation(format!(
                    "step {step_id} is not a loop step"
                )));
            }
            WorkflowEvent::StepIterationCompleted {
                step_id,
                iteration: step.iteration + 1,
                output,
                completed_at: now,
            }
        }
        WorkflowCommand::CompleteStep { step_id, result } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Complete)?;
            WorkflowEvent::StepCompleted {
                step_id,
                result,
                completed_at: now,
            }
        }
        WorkflowCommand::FailStep { step_id, error } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Fail)?;
            WorkflowEvent::StepFailed {
                step_id,
                error,
                failed_at: now,
            }
        }
        WorkflowCommand::SkipStep { step_id, reason } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Skip)?;
            WorkflowEvent::StepSkipped {
                step_id,
                reason,
                skipped_at: now,
            }
        }
        WorkflowCommand::PreemptStep { step_id, reason } => {
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Preempt)?;
            WorkflowEvent::StepPreempted {
                released_agent: snapshot.assigned_agents.get(&step_id).cloned(),
                step_id,
                reason,
                preempted_at: now,
            }
        }
        WorkflowCommand::RescheduleStep {
            step_id,
            not_before,
            reason,
        } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Preempt)?;
            WorkflowEvent::StepRescheduled {
                step_id,
                not_before,
                reason,
                rescheduled_at: now,
            }
        }
        WorkflowCommand::RetryStep {
            step_id,
            backoff_ms,
        } => {
            require_step_facts_allowed(snapshot)?;
            let step = require_step(snapshot, &step_id)?;
            step_transition(step.status, StepTrigger::Retry)?;
            let budget = snapshot.definition.retry_policy.max_retries;
            if step.attempts >= budget {
                return Err(WorkflowError::validation(format!(
                    "step {step_id} exhausted its retry budget of {budget}"
                )));
            }
            WorkflowEvent::StepRetried {
                step_id,
                attempt: step.attempts + 1,
                not_before: now.plus_millis(backoff_ms),
                retried_at: now,
            }
        }

        WorkflowCommand::UpdateContext { updates } => {
            if status.is_terminal() {
                return Err(WorkflowError::InvalidTransition {
                    state: snapshot.phase.to_string(),
                    trigger: "update_context".to_string(),
                });
            }
            if updates.is_empty() {
                return Ok(Vec::new());
            }
            WorkflowEvent::ContextUpdated {
                updates,
                updated_at: now,
            }
        }
        WorkflowCommand::RecordCheckpoint { checkpoint_id } => {
            require_step_facts_allowed(snapshot)?;
            WorkflowEvent::CheckpointRecorded {
                checkpoint_id,
                recorded_at: now,
            }
        }

        WorkflowCommand::InitiateRecovery {
            failure,
            severity,
            strategy,
        } => {
            if status.is_terminal() {
                return Err(WorkflowError::InvalidTransition {
                    state: snapshot.phase.to_string(),
                    trigger: "initiate_recovery".to_string(),
                });
            }
            if !(1..=10).contains(&severity) {
                return Err(WorkflowError::validation(format!(
                    "severity {severity} outside 1..=10"
                )));
            }
            WorkflowEvent::RecoveryInitiated {
                failure,
                severity,
                strategy,
                initiated_at: now,
            }
        }
        WorkflowCommand::RestoreCheckpoint {
            checkpoint_id,
            state,
        } => {
            require_automatic_recovery_allowed(snapshot, "restore_checkpoint")?;
            if state.phase.status().is_settled() {
                return Err(WorkflowError::validation(
                    "cannot restore a checkpoint taken in a settled state",
                ));
            }
            WorkflowEvent::CheckpointRestored {
                checkpoint_id,
                state,
                restored_at: now,
            }
        }
        WorkflowCommand::ApplyPartialRollback {
            checkpoint_id,
            steps,
        } => {
            require_automatic_recovery_allowed(snapshot, "apply_partial_rollback")?;
            if let Some(unknown) = steps.keys().find(|id| !snapshot.steps.contains_key(*id)) {
                return Err(WorkflowError::validation(format!("unknown step {unknown}")));
            }
            WorkflowEvent::PartialRollbackApplied {
                checkpoint_id,
                steps,
                applied_at: now,
            }
        }
        WorkflowCommand::EscalateToManual { reason } => {
            transition(snapshot.phase, WorkflowTrigger::Escalate)?;
            WorkflowEvent::EscalatedToManual {
                reason,
                escalated_at: now,
            }
        }
        WorkflowCommand::ResolveManually { note } => {
            transition(snapshot.phase, WorkflowTrigger::ResolveManually)?;
            WorkflowEvent::ManualResolutionApplied {
                note,
                resolved_at: now,
            }
        }
        WorkflowCommand::EscalateConflict {
            conflict_id,
            severity,
            description,
        } => {
            transition(snapshot.phase, WorkflowTrigger::Escalate)?;
            WorkflowEvent::ConflictEscalated {
                conflict_id,
                severity,
                description,
                escalated_at: now,
            }
        }

        WorkflowCommand::AdoptReplica {
            remote_version,
            merged,
            state,
        } => {
            if status.is_terminal() {
                return Err(WorkflowError::InvalidTransition {
                    state: snapshot.phase.to_string(),
                    trigger: "adopt_replica".to_string(),
                });
            }
            if let Some(unknown) = state.steps.keys().find(|id| !snapshot.steps.contains_key(*id))
            {
                return Err(WorkflowError::validation(format!(
                    "replica references unknown step {unknown}"
                )));
            }
            replica_transition(snapshot.phase, state.phase)?;
            WorkflowEvent::ReplicaReconciled {
                remote_version,
                merged,
                state,
                reconciled_at: now,
            }
        }
    };

    Ok(vec![event])
}

fn require_step<'a>(
    snapshot: &'a WorkflowSnapshot,
    step_id: &StepId,
) -> Result<&'a crate::domain::snapshot::StepState, WorkflowError> {
    snapshot
        .step(step_id)
        .ok_or_else(|| WorkflowError::validation(format!("unknown step {step_id}")))
}

/// Step facts are accepted while ACTIVE or PAUSED.
fn require_step_facts_allowed(snapshot: &WorkflowSnapshot) -> Result<(), WorkflowError> {
    match snapshot.status() {
        WorkflowStatus::Active | WorkflowStatus::Paused => Ok(()),
        _ => Err(WorkflowError::InvalidTransition {
            state: snapshot.phase.to_string(),
            trigger: "step_update".to_string(),
        }),
    }
}

/// Automatic recovery may act on ACTIVE or non-parked PAUSED workflows.
fn require_automatic_recovery_allowed(
    snapshot: &WorkflowSnapshot,
    trigger: &str,
) -> Result<(), WorkflowError> {
    match snapshot.status() {
        WorkflowStatus::Active => Ok(()),
        WorkflowStatus::Paused if !snapshot.phase.is_parked() => Ok(()),
        _ => Err(WorkflowError::InvalidTransition {
            state: snapshot.phase.to_string(),
            trigger: trigger.to_string(),
        }),
    }
}

/// Structural checks on a definition before it is recorded.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if definition.id.as_str().trim().is_empty() {
        return Err(WorkflowError::validation("workflow id must not be empty"));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::validation(format!(
                "duplicate step id {}",
                step.id
            )));
        }
        match &step.step_type {
            StepType::Loop { max_iterations, .. } if *max_iterations == 0 => {
                return Err(WorkflowError::validation(format!(
                    "loop step {} needs max_iterations >= 1",
                    step.id
                )));
            }
            StepType::Synchronization { required_agents } if *required_agents == 0 => {
                return Err(WorkflowError::validation(format!(
                    "synchronization step {} needs required_agents >= 1",
                    step.id
                )));
            }
            _ => {}
        }
    }

    for step in &definition.steps {
        if let Some(dep) = step.depends_on.iter().find(|dep| !seen.contains(dep.as_str())) {
            return Err(WorkflowError::validation(format!(
                "step {} depends on unknown step {dep}",
                step.id
            )));
        }
    }

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for (index, step) in definition.steps.iter().enumerate() {
        graph.add_node(index);
        for dep in definition.effective_dependencies(&step.id) {
            if let Some(from) = definition.steps.iter().position(|s| s.id == dep) {
                graph.add_edge(from, index, ());
            }
        }
    }
    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(WorkflowError::validation(
            "step dependencies contain a cycle",
        ));
    }

    Ok(())
}

#[cfg(test)]
#[path = "../tests/aggregate_tests.rs"]
mod tests;
