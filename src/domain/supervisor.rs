//! Workflow supervisor for fault-tolerant actor management.
//!
//! The supervisor owns the registry of live workflow actors. A failed or
//! unexpectedly stopped actor is respawned from its original arguments; its
//! state comes back from the event store on the next command.

use crate::domain::actor::{WorkflowActor, WorkflowActorArgs, WorkflowMessage};
use crate::domain::types::WorkflowId;
use async_trait::async_trait;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Messages for the workflow supervisor.
pub enum SupervisorMsg {
    /// Spawn (or return the existing) actor for a workflow.
    Spawn(
        Box<WorkflowActorArgs>,
        oneshot::Sender<Result<ActorRef<WorkflowMessage>, String>>,
    ),
    /// Current actor for a workflow, if one is registered.
    Lookup(WorkflowId, oneshot::Sender<Option<ActorRef<WorkflowMessage>>>),
    /// Stop a workflow's actor without respawning it.
    Retire(WorkflowId, oneshot::Sender<bool>),
}

struct Supervised {
    actor: ActorRef<WorkflowMessage>,
    args: WorkflowActorArgs,
}

#[derive(Default)]
pub struct SupervisorState {
    workflows: HashMap<WorkflowId, Supervised>,
    by_actor: HashMap<ActorId, WorkflowId>,
}

impl SupervisorState {
    fn register(&mut self, actor: ActorRef<WorkflowMessage>, args: WorkflowActorArgs) {
        self.by_actor
            .insert(actor.get_id(), args.workflow_id.clone());
        self.workflows
            .insert(args.workflow_id.clone(), Supervised { actor, args });
    }
}

/// The workflow supervisor actor.
pub struct WorkflowSupervisor;

async fn spawn_child(
    myself: &ActorRef<SupervisorMsg>,
    args: WorkflowActorArgs,
) -> Result<ActorRef<WorkflowMessage>, ActorProcessingErr> {
    let (actor, _handle) =
        WorkflowActor::spawn_linked(None, WorkflowActor, args, myself.get_cell()).await?;
    Ok(actor)
}

#[async_trait]
impl Actor for WorkflowSupervisor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: (),
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(SupervisorState::default())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        msg: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match msg {
            SupervisorMsg::Spawn(args, reply) => {
                let args = *args;
                let result = match state.workflows.get(&args.workflow_id) {
                    Some(existing) => Ok(existing.actor.clone()),
                    None => match spawn_child(&myself, args.clone()).await {
                        Ok(actor) => {
                            state.register(actor.clone(), args);
                            Ok(actor)
                        }
                        Err(err) => Err(err.to_string()),
                    },
                };
                let _ = reply.send(result);
            }
            SupervisorMsg::Lookup(workflow_id, reply) => {
                let actor = state
                    .workflows
                    .get(&workflow_id)
                    .map(|supervised| supervised.actor.clone());
                let _ = reply.send(actor);
            }
            SupervisorMsg::Retire(workflow_id, reply) => {
                let retired = match state.workflows.remove(&workflow_id) {
                    Some(supervised) => {
                        state.by_actor.remove(&supervised.actor.get_id());
                        supervised.actor.stop(Some("retired".to_string()));
                        true
                    }
                    None => false,
                };
                let _ = reply.send(retired);
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        evt: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let cell = match &evt {
            SupervisionEvent::ActorFailed(cell, _) | SupervisionEvent::ActorTerminated(cell, _, _) => {
                cell
            }
            _ => return Ok(()),
        };

        // Retired actors were already removed from the registry.
        let Some(workflow_id) = state.by_actor.remove(&cell.get_id()) else {
            return Ok(());
        };
        let Some(supervised) = state.workflows.remove(&workflow_id) else {
            return Ok(());
        };

        tracing::warn!(workflow_id = %workflow_id, "Workflow actor stopped unexpectedly, respawning");
        let actor = spawn_child(&myself, supervised.args.clone()).await?;
        state.register(actor, supervised.args);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
