//! Workflow commands for the CQRS aggregate.
//!
//! Commands express intent. The aggregate validates them against the
//! transition tables and turns accepted ones into events.

use crate::domain::failure::{FailureSignal, RecoveryStrategy};
use crate::domain::snapshot::{ExecutionState, StepState};
use crate::domain::types::{AgentId, StepId, TimestampUtc, WorkflowDefinition};
use crate::state_machine::WorkflowTrigger;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Commands for the workflow aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCommand {
    CreateWorkflow {
        definition: WorkflowDefinition,
    },
    Activate,
    /// Move between ACTIVE substates (execute, wait, synchronize, finalize).
    ChangeSubstate {
        trigger: WorkflowTrigger,
    },
    Pause {
        reason: String,
    },
    Resume,
    Complete,
    Fail {
        reason: String,
    },
    Cancel {
        reason: String,
    },
    RetryWorkflow,

    AssignStep {
        step_id: StepId,
        agent_id: AgentId,
    },
    StartStep {
        step_id: StepId,
    },
    CompleteIteration {
        step_id: StepId,
        output: Value,
    },
    CompleteStep {
        step_id: StepId,
        result: Value,
    },
    FailStep {
        step_id: StepId,
        error: String,
    },
    SkipStep {
        step_id: StepId,
        reason: String,
    },
    PreemptStep {
        step_id: StepId,
        reason: String,
    },
    RescheduleStep {
        step_id: StepId,
        not_before: TimestampUtc,
        reason: String,
    },
    RetryStep {
        step_id: StepId,
        backoff_ms: u64,
    },

    UpdateContext {
        updates: Map<String, Value>,
    },
    RecordCheckpoint {
        checkpoint_id: Uuid,
    },

    InitiateRecovery {
        failure: FailureSignal,
        severity: u8,
        strategy: RecoveryStrategy,
    },
    RestoreCheckpoint {
        checkpoint_id: Uuid,
        state: ExecutionState,
    },
    ApplyPartialRollback {
        checkpoint_id: Uuid,
        steps: BTreeMap<StepId, StepState>,
    },
    EscalateToManual {
        reason: String,
    },
    ResolveManually {
        note: String,
    },
    EscalateConflict {
        conflict_id: Uuid,
        severity: u8,
        description: String,
    },

    AdoptReplica {
        remote_version: u64,
        merged: bool,
        state: ExecutionState,
    },
}

impl WorkflowCommand {
    /// Compensating commands remain accepted after cancellation.
    pub fn is_compensating(&self) -> bool {
        matches!(self, WorkflowCommand::PreemptStep { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowCommand::CreateWorkflow { .. } => "create_workflow",
            WorkflowCommand::Activate => "activate",
            WorkflowCommand::ChangeSubstate { .. } => "change_substate",
            WorkflowCommand::Pause { .. } => "pause",
            WorkflowCommand::Resume => "resume",
            WorkflowCommand::Complete => "complete",
            WorkflowCommand::Fail { .. } => "fail",
            WorkflowCommand::Cancel { .. } => "cancel",
            WorkflowCommand::RetryWorkflow => "retry_workflow",
            WorkflowCommand::AssignStep { .. } => "assign_step",
            WorkflowCommand::StartStep { .. } => "start_step",
            WorkflowCommand::CompleteIteration { .. } => "complete_iteration",
            WorkflowCommand::CompleteStep { .. } => "complete_step",
            WorkflowCommand::FailStep { .. } => "fail_step",
            WorkflowCommand::SkipStep { .. } => "skip_step",
            WorkflowCommand::PreemptStep { .. } => "preempt_step",
            WorkflowCommand::RescheduleStep { .. } => "reschedule_step",
            WorkflowCommand::RetryStep { .. } => "retry_step",
            WorkflowCommand::UpdateContext { .. } => "update_context",
            WorkflowCommand::RecordCheckpoint { .. } => "record_checkpoint",
            WorkflowCommand::InitiateRecovery { .. } => "initiate_recovery",
            WorkflowCommand::RestoreCheckpoint { .. } => "restore_checkpoint",
            WorkflowCommand::ApplyPartialRollback { .. } => "apply_partial_rollback",
            WorkflowCommand::EscalateToManual { .. } => "escalate_to_manual",
            WorkflowCommand::ResolveManually { .. } => "resolve_manually",
            WorkflowCommand::EscalateConflict { .. } => "escalate_conflict",
            WorkflowCommand::AdoptReplica { .. } => "adopt_replica",
        }
    }
}
