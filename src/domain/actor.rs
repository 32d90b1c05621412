//! Per-workflow actor for CQRS command handling.
//!
//! Each workflow gets one actor. Its mailbox serializes every command for
//! that workflow, so commands for one workflow never race each other while
//! different workflows proceed in parallel.

use crate::cache::TieredCache;
use crate::domain::cqrs::{SnapshotProjection, WorkflowAggregate, WorkflowCommand};
use crate::domain::errors::{Rejected, StorageError, WorkflowError};
use crate::domain::services::WorkflowServices;
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::WorkflowId;
use crate::event_store::{EventMetadata, RecordedEvent, WorkflowEventStore};
use async_trait::async_trait;
use cqrs_es::{AggregateError, CqrsFramework};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

/// A command plus the causation/correlation ids its events will carry.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub command: WorkflowCommand,
    pub metadata: EventMetadata,
}

impl CommandEnvelope {
    pub fn new(command: WorkflowCommand) -> Self {
        Self {
            command,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An accepted command: the events it recorded and the resulting snapshot.
#[derive(Debug, Clone)]
pub struct Committed {
    pub snapshot: Arc<WorkflowSnapshot>,
    pub events: Vec<RecordedEvent>,
}

pub type CommandOutcome = Result<Committed, Rejected>;

/// Messages that can be sent to a workflow actor.
pub enum WorkflowMessage {
    /// Execute a command and reply with the outcome.
    Command(Box<CommandEnvelope>, oneshot::Sender<CommandOutcome>),
    /// Current snapshot, `None` if the workflow was never created.
    GetSnapshot(oneshot::Sender<Result<Option<Arc<WorkflowSnapshot>>, WorkflowError>>),
}

/// Arguments for spawning a workflow actor.
#[derive(Clone)]
pub struct WorkflowActorArgs {
    pub workflow_id: WorkflowId,
    pub store: WorkflowEventStore,
    pub cache: Arc<TieredCache>,
    /// Every committed event is broadcast here.
    pub event_tx: broadcast::Sender<RecordedEvent>,
    pub services: WorkflowServices,
}

/// State maintained by the workflow actor.
pub struct WorkflowActorState {
    pub cqrs: CqrsFramework<WorkflowAggregate, WorkflowEventStore>,
    pub workflow_id: WorkflowId,
    pub store: WorkflowEventStore,
    pub cache: Arc<TieredCache>,
}

pub struct WorkflowActor;

impl WorkflowActor {
    /// Builds the CQRS framework from actor arguments.
    pub fn build_cqrs(
        args: &WorkflowActorArgs,
    ) -> CqrsFramework<WorkflowAggregate, WorkflowEventStore> {
        let projection = SnapshotProjection::new(args.cache.clone(), args.event_tx.clone());
        CqrsFramework::new(
            args.store.clone(),
            vec![Box::new(projection)],
            args.services.clone(),
        )
    }
}

impl WorkflowActorState {
    async fn execute(&self, envelope: CommandEnvelope) -> CommandOutcome {
        let head_before = self
            .store
            .head(&self.workflow_id)
            .await
            .map_err(Rejected::from)?;

        let result = self
            .cqrs
            .execute_with_metadata(
                self.workflow_id.as_str(),
                envelope.command,
                envelope.metadata.to_map(),
            )
            .await;

        if let Err(err) = result {
            let error = map_aggregate_error(err);
            let snapshot = self.cache.get(&self.workflow_id).await.ok().flatten();
            return Err(Rejected::new(error, snapshot));
        }

        let events = self
            .store
            .read(&self.workflow_id, head_before + 1)
            .await
            .map_err(Rejected::from)?;
        let snapshot = self
            .cache
            .get(&self.workflow_id)
            .await
            .map_err(Rejected::from)?
            .ok_or_else(|| Rejected::from(WorkflowError::NotFound(self.workflow_id.clone())))?;
        Ok(Committed { snapshot, events })
    }
}

/// Maps framework errors back onto the domain taxonomy.
pub fn map_aggregate_error(err: AggregateError<WorkflowError>) -> WorkflowError {
    match err {
        AggregateError::UserError(err) => err,
        AggregateError::AggregateConflict => WorkflowError::ConcurrencyConflict {
            message: "aggregate was modified concurrently".to_string(),
        },
        AggregateError::UnexpectedError(err) => match err.downcast_ref::<WorkflowError>() {
            Some(inner) => inner.clone(),
            None => StorageError::Io {
                message: err.to_string(),
            }
            .into(),
        },
        other => StorageError::Io {
            message: other.to_string(),
        }
        .into(),
    }
}

#[async_trait]
impl Actor for WorkflowActor {
    type Msg = WorkflowMessage;
    type State = WorkflowActorState;
    type Arguments = WorkflowActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let cqrs = WorkflowActor::build_cqrs(&args);
        tracing::debug!(workflow_id = %args.workflow_id, "Workflow actor started");

        Ok(WorkflowActorState {
            cqrs,
            workflow_id: args.workflow_id,
            store: args.store,
            cache: args.cache,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkflowMessage::Command(envelope, reply) => {
                let name = envelope.command.name();
                let outcome = state.execute(*envelope).await;
                if let Err(rejected) = &outcome {
                    tracing::debug!(
                        workflow_id = %state.workflow_id,
                        command = name,
                        error = %rejected.error,
                        "Command rejected"
                    );
                }
                if reply.send(outcome).is_err() {
                    tracing::debug!("Command reply channel closed");
                }
            }
            WorkflowMessage::GetSnapshot(reply) => {
                let snapshot = state.cache.get(&state.workflow_id).await;
                if reply.send(snapshot).is_err() {
                    tracing::debug!("Snapshot reply channel closed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/actor_tests.rs"]
mod tests;
