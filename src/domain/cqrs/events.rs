//! Workflow events for the CQRS aggregate.
//!
//! Events are facts. They are the single source of truth for workflow state
//! and are persisted to the event log in order.

use crate::domain::failure::{FailureSignal, RecoveryStrategy};
use crate::domain::snapshot::{ExecutionState, StepState};
use crate::domain::types::{
    ActiveSubstate, AgentId, StepId, TimestampUtc, WorkflowDefinition,
};
use crate::state_machine::WorkflowTrigger;
use cqrs_es::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Events emitted by the workflow aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowCreated {
        definition: WorkflowDefinition,
        created_at: TimestampUtc,
    },
    WorkflowActivated {
        activated_at: TimestampUtc,
    },
    /// Movement between substates of ACTIVE.
    SubstateChanged {
        trigger: WorkflowTrigger,
        substate: ActiveSubstate,
        changed_at: TimestampUtc,
    },
    WorkflowPaused {
        reason: String,
        paused_at: TimestampUtc,
    },
    WorkflowResumed {
        resumed_at: TimestampUtc,
    },
    WorkflowCompleted {
        completed_at: TimestampUtc,
    },
    WorkflowFailed {
        reason: String,
        failed_at: TimestampUtc,
    },
    WorkflowCancelled {
        reason: String,
        cancelled_at: TimestampUtc,
    },
    /// Explicit retry back-edge from FAILED.
    WorkflowRetried {
        attempt: u32,
        retried_at: TimestampUtc,
    },

    StepAssigned {
        step_id: StepId,
        agent_id: AgentId,
        assigned_at: TimestampUtc,
    },
    StepStarted {
        step_id: StepId,
        started_at: TimestampUtc,
    },
    StepIterationCompleted {
        step_id: StepId,
        iteration: u32,
        output: Value,
        completed_at: TimestampUtc,
    },
    StepCompleted {
        step_id: StepId,
        result: Value,
        completed_at: TimestampUtc,
    },
    StepFailed {
        step_id: StepId,
        error: String,
        failed_at: TimestampUtc,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
        skipped_at: TimestampUtc,
    },
    /// Compensating: the step goes back to pending and its agent is released.
    StepPreempted {
        step_id: StepId,
        released_agent: Option<AgentId>,
        reason: String,
        preempted_at: TimestampUtc,
    },
    /// Compensating: the step may not start before `not_before`.
    StepRescheduled {
        step_id: StepId,
        not_before: TimestampUtc,
        reason: String,
        rescheduled_at: TimestampUtc,
    },
    StepRetried {
        step_id: StepId,
        attempt: u32,
        not_before: TimestampUtc,
        retried_at: TimestampUtc,
    },

    ContextUpdated {
        updates: Map<String, Value>,
        updated_at: TimestampUtc,
    },
    CheckpointRecorded {
        checkpoint_id: Uuid,
        recorded_at: TimestampUtc,
    },

    RecoveryInitiated {
        failure: FailureSignal,
        severity: u8,
        strategy: RecoveryStrategy,
        initiated_at: TimestampUtc,
    },
    CheckpointRestored {
        checkpoint_id: Uuid,
        state: ExecutionState,
        restored_at: TimestampUtc,
    },
    PartialRollbackApplied {
        checkpoint_id: Uuid,
        steps: BTreeMap<StepId, StepState>,
        applied_at: TimestampUtc,
    },
    EscalatedToManual {
        reason: String,
        escalated_at: TimestampUtc,
    },
    ManualResolutionApplied {
        note: String,
        resolved_at: TimestampUtc,
    },
    ConflictEscalated {
        conflict_id: Uuid,
        severity: u8,
        description: String,
        escalated_at: TimestampUtc,
    },

    /// The edge copy adopted the reconciled cloud state.
    ReplicaReconciled {
        remote_version: u64,
        merged: bool,
        state: ExecutionState,
        reconciled_at: TimestampUtc,
    },
}

impl WorkflowEvent {
    /// Fieldless discriminant, used to route events to handlers.
    pub fn kind(&self) -> EventKind {
        match self {
            WorkflowEvent::WorkflowCreated { .. } => EventKind::WorkflowCreated,
            WorkflowEvent::WorkflowActivated { .. } => EventKind::WorkflowActivated,
            WorkflowEvent::SubstateChanged { .. } => EventKind::SubstateChanged,
            WorkflowEvent::WorkflowPaused { .. } => EventKind::WorkflowPaused,
            WorkflowEvent::WorkflowResumed { .. } => EventKind::WorkflowResumed,
            WorkflowEvent::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            WorkflowEvent::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            WorkflowEvent::WorkflowCancelled { .. } => EventKind::WorkflowCancelled,
            WorkflowEvent::WorkflowRetried { .. } => EventKind::WorkflowRetried,
            WorkflowEvent::StepAssigned { .. } => EventKind::StepAssigned,
            WorkflowEvent::StepStarted { .. } => EventKind::StepStarted,
            WorkflowEvent::StepIterationCompleted { .. } => EventKind::StepIterationCompleted,
            WorkflowEvent::StepCompleted { .. } => EventKind::StepCompleted,
            WorkflowEvent::StepFailed { .. } => EventKind::StepFailed,
            WorkflowEvent::StepSkipped { .. } => EventKind::StepSkipped,
            WorkflowEvent::StepPreempted { .. } => EventKind::StepPreempted,
            WorkflowEvent::StepRescheduled { .. } => EventKind::StepRescheduled,
            WorkflowEvent::StepRetried { .. } => EventKind::StepRetried,
            WorkflowEvent::ContextUpdated { .. } => EventKind::ContextUpdated,
            WorkflowEvent::CheckpointRecorded { .. } => EventKind::CheckpointRecorded,
            WorkflowEvent::RecoveryInitiated { .. } => EventKind::RecoveryInitiated,
            WorkflowEvent::CheckpointRestored { .. } => EventKind::CheckpointRestored,
            WorkflowEvent::PartialRollbackApplied { .. } => EventKind::PartialRollbackApplied,
            WorkflowEvent::EscalatedToManual { .. } => EventKind::EscalatedToManual,
            WorkflowEvent::ManualResolutionApplied { .. } => EventKind::ManualResolutionApplied,
            WorkflowEvent::ConflictEscalated { .. } => EventKind::ConflictEscalated,
            WorkflowEvent::ReplicaReconciled { .. } => EventKind::ReplicaReconciled,
        }
    }

    /// Step the event concerns, if any.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            WorkflowEvent::StepAssigned { step_id, .. }
            | WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepIterationCompleted { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepSkipped { step_id, .. }
            | WorkflowEvent::StepPreempted { step_id, .. }
            | WorkflowEvent::StepRescheduled { step_id, .. }
            | WorkflowEvent::StepRetried { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// Discriminant of [`WorkflowEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowCreated,
    WorkflowActivated,
    SubstateChanged,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowRetried,
    StepAssigned,
    StepStarted,
    StepIterationCompleted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepPreempted,
    StepRescheduled,
    StepRetried,
    ContextUpdated,
    CheckpointRecorded,
    RecoveryInitiated,
    CheckpointRestored,
    PartialRollbackApplied,
    EscalatedToManual,
    ManualResolutionApplied,
    ConflictEscalated,
    ReplicaReconciled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowCreated => "WorkflowCreated",
            EventKind::WorkflowActivated => "WorkflowActivated",
            EventKind::SubstateChanged => "SubstateChanged",
            EventKind::WorkflowPaused => "WorkflowPaused",
            EventKind::WorkflowResumed => "WorkflowResumed",
            EventKind::WorkflowCompleted => "WorkflowCompleted",
            EventKind::WorkflowFailed => "WorkflowFailed",
            EventKind::WorkflowCancelled => "WorkflowCancelled",
            EventKind::WorkflowRetried => "WorkflowRetried",
            EventKind::StepAssigned => "StepAssigned",
            EventKind::StepStarted => "StepStarted",
            EventKind::StepIterationCompleted => "StepIterationCompleted",
            EventKind::StepCompleted => "StepCompleted",
            EventKind::StepFailed => "StepFailed",
            EventKind::StepSkipped => "StepSkipped",
            EventKind::StepPreempted => "StepPreempted",
            EventKind::StepRescheduled => "StepRescheduled",
            EventKind::StepRetried => "StepRetried",
            EventKind::ContextUpdated => "ContextUpdated",
            EventKind::CheckpointRecorded => "CheckpointRecorded",
            EventKind::RecoveryInitiated => "RecoveryInitiated",
            EventKind::CheckpointRestored => "CheckpointRestored",
            EventKind::PartialRollbackApplied => "PartialRollbackApplied",
            EventKind::EscalatedToManual => "EscalatedToManual",
            EventKind::ManualResolutionApplied => "ManualResolutionApplied",
            EventKind::ConflictEscalated => "ConflictEscalated",
            EventKind::ReplicaReconciled => "ReplicaReconciled",
        }
    }
}

impl DomainEvent for WorkflowEvent {
    fn event_type(&self) -> String {
        self.kind().as_str().to_string()
    }

    fn event_version(&self) -> String {
        "1".to_string()
    }
}
