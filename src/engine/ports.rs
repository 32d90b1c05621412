//! Contracts the engine consumes from its collaborators.
//!
//! Agent selection, execution and observability all live outside the core.
//! The engine only emits [`Directive`]s, asks an [`AgentSelector`] for an
//! agent and reports [`LifecycleEvent`]s to a [`LifecycleSink`].

use crate::coordination::ProceedDirective;
use crate::domain::cqrs::EventKind;
use crate::domain::errors::TransportError;
use crate::domain::types::{
    AgentId, StepId, TimestampUtc, WorkflowId, WorkflowStatus, WorkflowStepDefinition,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// What the selector is asked to place.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub workflow_id: WorkflowId,
    pub step: WorkflowStepDefinition,
    /// Workflow candidates minus the agents this step was released from.
    pub candidates: Vec<AgentId>,
    pub priority: u8,
    /// Retries already spent on the step.
    pub attempt: u32,
}

/// External scheduler choosing an agent for a ready step.
#[async_trait]
pub trait AgentSelector: Send + Sync + 'static {
    /// `None` leaves the step pending until the next pass.
    async fn select(&self, request: &StepRequest) -> Option<AgentId>;
}

/// Instruction for an execution adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    Assigned {
        workflow_id: WorkflowId,
        step_id: StepId,
        agent_id: AgentId,
    },
    Started {
        workflow_id: WorkflowId,
        step_id: StepId,
        agent_id: Option<AgentId>,
        /// Loop iteration being started, 1 for plain steps.
        iteration: u32,
        parameters: Map<String, Value>,
    },
    Cancel {
        workflow_id: WorkflowId,
        step_id: StepId,
        agent_id: Option<AgentId>,
        reason: String,
    },
    /// Barrier released: how this participant proceeds.
    Proceed {
        workflow_id: WorkflowId,
        step_id: StepId,
        point_id: String,
        directive: ProceedDirective,
    },
}

impl Directive {
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            Directive::Assigned { workflow_id, .. }
            | Directive::Started { workflow_id, .. }
            | Directive::Cancel { workflow_id, .. }
            | Directive::Proceed { workflow_id, .. } => workflow_id,
        }
    }

    pub fn step_id(&self) -> &StepId {
        match self {
            Directive::Assigned { step_id, .. }
            | Directive::Started { step_id, .. }
            | Directive::Cancel { step_id, .. }
            | Directive::Proceed { step_id, .. } => step_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Directive::Assigned { .. } => "assigned",
            Directive::Started { .. } => "started",
            Directive::Cancel { .. } => "cancel",
            Directive::Proceed { .. } => "proceed",
        }
    }
}

/// Delivers directives to robots, operators or AI systems. Results come
/// back through `WorkflowEngine::complete_step` and `fail_step`.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync + 'static {
    async fn dispatch(&self, directive: Directive) -> Result<(), TransportError>;
}

/// Adapter forwarding directives into a channel.
#[derive(Debug, Clone)]
pub struct ChannelAdapter {
    tx: mpsc::Sender<Directive>,
}

impl ChannelAdapter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Directive>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ExecutionAdapter for ChannelAdapter {
    async fn dispatch(&self, directive: Directive) -> Result<(), TransportError> {
        self.tx
            .send(directive)
            .await
            .map_err(|_| TransportError::Unavailable {
                message: "directive channel closed".to_string(),
            })
    }
}

/// Adapter that only logs. Used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAdapter;

#[async_trait]
impl ExecutionAdapter for LoggingAdapter {
    async fn dispatch(&self, directive: Directive) -> Result<(), TransportError> {
        tracing::debug!(
            workflow_id = %directive.workflow_id(),
            step_id = %directive.step_id(),
            directive = directive.name(),
            "Directive dropped, no execution adapter configured"
        );
        Ok(())
    }
}

/// Answers resource-based dependency predicates.
pub trait ResourceAvailability: Send + Sync + 'static {
    fn is_available(&self, resource: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAvailable;

impl ResourceAvailability for AlwaysAvailable {
    fn is_available(&self, _resource: &str) -> bool {
        true
    }
}

/// A structured lifecycle event for observability backends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub workflow_id: WorkflowId,
    pub kind: EventKind,
    pub sequence: u64,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: TimestampUtc,
}

impl LifecycleEvent {
    /// Coarse emitting component, used to tag log lines.
    pub fn component(&self) -> &'static str {
        match self.kind {
            EventKind::StepAssigned
            | EventKind::StepStarted
            | EventKind::StepIterationCompleted
            | EventKind::StepCompleted
            | EventKind::StepFailed
            | EventKind::StepSkipped
            | EventKind::StepPreempted
            | EventKind::StepRescheduled
            | EventKind::StepRetried => "Step",
            EventKind::RecoveryInitiated
            | EventKind::CheckpointRecorded
            | EventKind::CheckpointRestored
            | EventKind::PartialRollbackApplied
            | EventKind::EscalatedToManual
            | EventKind::ManualResolutionApplied => "Recovery",
            EventKind::ConflictEscalated => "Conflict",
            EventKind::ReplicaReconciled => "Consistency",
            _ => "Workflow",
        }
    }
}

/// Injected observability backend.
pub trait LifecycleSink: Send + Sync + 'static {
    fn emit(&self, event: &LifecycleEvent);
}

/// Sink writing lifecycle events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LifecycleSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        tracing::info!(
            workflow_id = %event.workflow_id,
            kind = event.kind.as_str(),
            sequence = event.sequence,
            status = %event.status,
            step_id = event.step_id.as_ref().map(|id| id.as_str()),
            detail = event.detail.as_deref(),
            component = event.component(),
            "Workflow lifecycle"
        );
    }
}
