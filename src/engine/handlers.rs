//! Explicit event handler registration.
//!
//! Handlers are listed as `(EventKind, handler)` pairs when the engine is
//! built. Nothing registers itself: the list handed to the builder is the
//! complete set, and it is dispatched in registration order after every
//! committed event.

use super::ports::{LifecycleEvent, LifecycleSink};
use crate::domain::cqrs::{EventKind, WorkflowEvent};
use crate::domain::snapshot::WorkflowSnapshot;
use crate::event_store::RecordedEvent;
use std::sync::Arc;

/// Observer of committed events. Runs on the committing task, so it should
/// hand slow work off to a channel.
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// `snapshot` is the state right after the command that recorded `event`.
    fn handle(&self, event: &RecordedEvent, snapshot: &WorkflowSnapshot);
}

/// Event kinds reported to the lifecycle sink.
pub const LIFECYCLE_KINDS: [EventKind; 18] = [
    EventKind::WorkflowCreated,
    EventKind::WorkflowActivated,
    EventKind::WorkflowPaused,
    EventKind::WorkflowResumed,
    EventKind::WorkflowCompleted,
    EventKind::WorkflowFailed,
    EventKind::WorkflowCancelled,
    EventKind::WorkflowRetried,
    EventKind::StepStarted,
    EventKind::StepCompleted,
    EventKind::StepFailed,
    EventKind::StepSkipped,
    EventKind::RecoveryInitiated,
    EventKind::CheckpointRestored,
    EventKind::PartialRollbackApplied,
    EventKind::EscalatedToManual,
    EventKind::ConflictEscalated,
    EventKind::ReplicaReconciled,
];

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<(EventKind, Arc<dyn EventHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry reporting [`LIFECYCLE_KINDS`] to `sink`.
    pub fn lifecycle(sink: Arc<dyn LifecycleSink>) -> Self {
        let handler: Arc<dyn EventHandler> = Arc::new(LifecycleHandler::new(sink));
        let mut registry = Self::new();
        for kind in LIFECYCLE_KINDS {
            registry.register(kind, handler.clone());
        }
        registry
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.entries.push((kind, handler));
    }

    pub fn with(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handlers_for(&self, kind: EventKind) -> impl Iterator<Item = &Arc<dyn EventHandler>> {
        self.entries
            .iter()
            .filter(move |(registered, _)| *registered == kind)
            .map(|(_, handler)| handler)
    }

    pub fn dispatch(&self, event: &RecordedEvent, snapshot: &WorkflowSnapshot) {
        let kind = event.event.kind();
        for handler in self.handlers_for(kind) {
            tracing::trace!(
                handler = handler.name(),
                workflow_id = %event.workflow_id,
                kind = kind.as_str(),
                "Dispatching event to handler"
            );
            handler.handle(event, snapshot);
        }
    }
}

/// Turns committed events into [`LifecycleEvent`]s.
pub struct LifecycleHandler {
    sink: Arc<dyn LifecycleSink>,
}

impl LifecycleHandler {
    pub fn new(sink: Arc<dyn LifecycleSink>) -> Self {
        Self { sink }
    }
}

impl EventHandler for LifecycleHandler {
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    fn handle(&self, event: &RecordedEvent, snapshot: &WorkflowSnapshot) {
        self.sink.emit(&LifecycleEvent {
            workflow_id: event.workflow_id.clone(),
            kind: event.event.kind(),
            sequence: event.sequence,
            status: snapshot.status(),
            step_id: event.event.step_id().cloned(),
            detail: detail(&event.event),
            at: event.recorded_at,
        });
    }
}

fn detail(event: &WorkflowEvent) -> Option<String> {
    match event {
        WorkflowEvent::WorkflowPaused { reason, .. }
        | WorkflowEvent::WorkflowFailed { reason, .. }
        | WorkflowEvent::WorkflowCancelled { reason, .. }
        | WorkflowEvent::StepSkipped { reason, .. }
        | WorkflowEvent::EscalatedToManual { reason, .. } => Some(reason.clone()),
        WorkflowEvent::StepFailed { error, .. } => Some(error.clone()),
        WorkflowEvent::WorkflowRetried { attempt, .. } => Some(format!("attempt {attempt}")),
        WorkflowEvent::RecoveryInitiated {
            failure,
            severity,
            strategy,
            ..
        } => Some(format!(
            "{} severity {severity}: {strategy}",
            failure.kind.display_name()
        )),
        WorkflowEvent::CheckpointRestored { checkpoint_id, .. }
        | WorkflowEvent::PartialRollbackApplied { checkpoint_id, .. } => {
            Some(format!("checkpoint {checkpoint_id}"))
        }
        WorkflowEvent::ConflictEscalated {
            severity,
            description,
            ..
        } => Some(format!("severity {severity}: {description}")),
        WorkflowEvent::ReplicaReconciled {
            remote_version,
            merged,
            ..
        } => Some(format!("remote version {remote_version}, merged {merged}")),
        _ => None,
    }
}
