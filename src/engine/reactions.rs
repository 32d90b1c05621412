//! Event-driven reactions.
//!
//! Maps each committed event to the follow-up [`Work`] it implies.

use super::orchestration::{Pass, Work};
use super::ports::Directive;
use super::{point_id, WorkflowEngine};
use crate::domain::actor::Committed;
use crate::domain::cqrs::WorkflowEvent;
use crate::domain::failure::FailureSignal;
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::{StepId, StepStatus, StepType, WorkflowId, WorkflowStatus};

impl WorkflowEngine {
    pub(super) fn react(&self, committed: &Committed, pass: &mut Pass) {
        let snapshot = &committed.snapshot;
        let workflow_id = &snapshot.workflow_id;
        pass.touch(workflow_id);

        for record in &committed.events {
            let cause = Some(record.event_id);
            match &record.event {
                WorkflowEvent::WorkflowActivated { .. } => {
                    pass.push(Work::Checkpoint {
                        workflow_id: workflow_id.clone(),
                        label: "activated".to_string(),
                        cause,
                    });
                    pass.push(Work::Advance(workflow_id.clone()));
                }
                WorkflowEvent::StepAssigned { step_id, agent_id, .. } => {
                    pass.push(Work::Dispatch(Directive::Assigned {
                        workflow_id: workflow_id.clone(),
                        step_id: step_id.clone(),
                        agent_id: agent_id.clone(),
                    }));
                    pass.push(Work::Advance(workflow_id.clone()));
                }
                WorkflowEvent::StepStarted { step_id, .. } => {
                    self.on_step_started(snapshot, step_id, pass);
                }
                WorkflowEvent::StepIterationCompleted { step_id, output, .. } => {
                    pass.push(Work::Iterated {
                        workflow_id: workflow_id.clone(),
                        step_id: step_id.clone(),
                        output: output.clone(),
                        cause,
                    });
                }
                WorkflowEvent::StepCompleted { step_id, .. } => {
                    pass.push(Work::Checkpoint {
                        workflow_id: workflow_id.clone(),
                        label: format!("completed {step_id}"),
                        cause,
                    });
                    pass.push(Work::Advance(workflow_id.clone()));
                    pass.push(Work::Unblock(workflow_id.clone()));
                }
                WorkflowEvent::StepFailed { step_id, error, .. } => {
                    if !pass.is_recovering(workflow_id) {
                        pass.push(Work::Recover(FailureSignal::from_step_error(
                            workflow_id.clone(),
                            step_id.clone(),
                            error,
                        )));
                    }
                }
                WorkflowEvent::StepPreempted {
                    step_id,
                    released_agent,
                    reason,
                    ..
                } => {
                    pass.push(Work::Dispatch(Directive::Cancel {
                        workflow_id: workflow_id.clone(),
                        step_id: step_id.clone(),
                        agent_id: released_agent.clone(),
                        reason: reason.clone(),
                    }));
                    pass.push(Work::Advance(workflow_id.clone()));
                }
                WorkflowEvent::StepRescheduled {
                    step_id,
                    not_before,
                    reason,
                    ..
                } => {
                    pass.push(Work::Dispatch(Directive::Cancel {
                        workflow_id: workflow_id.clone(),
                        step_id: step_id.clone(),
                        agent_id: None,
                        reason: reason.clone(),
                    }));
                    pass.wake_at(workflow_id, *not_before);
                    pass.push(Work::Advance(workflow_id.clone()));
                }
                WorkflowEvent::StepRetried { not_before, .. } => {
                    pass.wake_at(workflow_id, *not_before);
                    pass.push(Work::Advance(workflow_id.clone()));
                }
                WorkflowEvent::StepSkipped { .. }
                | WorkflowEvent::WorkflowResumed { .. }
                | WorkflowEvent::ContextUpdated { .. }
                | WorkflowEvent::ManualResolutionApplied { .. }
                | WorkflowEvent::CheckpointRestored { .. }
                | WorkflowEvent::PartialRollbackApplied { .. }
                | WorkflowEvent::ReplicaReconciled { .. } => {
                    pass.push(Work::Advance(workflow_id.clone()));
                }
                WorkflowEvent::WorkflowCompleted { .. } => {
                    pass.push(Work::Unblock(workflow_id.clone()));
                    self.inner.coordinator.close_workflow(workflow_id);
                    for dependent in self.inner.graph.dependents(workflow_id) {
                        if self.inner.deferred.contains_key(&dependent) {
                            pass.push(Work::Activate(dependent));
                        }
                    }
                }
                WorkflowEvent::WorkflowFailed { reason, .. }
                | WorkflowEvent::WorkflowCancelled { reason, .. } => {
                    pass.push(Work::Unblock(workflow_id.clone()));
                    for point in self.inner.coordinator.points_for(workflow_id) {
                        self.inner.coordinator.close_point(&point.id);
                    }
                    self.inner.deferred.remove(workflow_id);
                    for (step_id, agent_id) in snapshot.running_steps() {
                        pass.push(Work::Dispatch(Directive::Cancel {
                            workflow_id: workflow_id.clone(),
                            step_id: step_id.clone(),
                            agent_id: agent_id.cloned(),
                            reason: reason.clone(),
                        }));
                    }
                }
                WorkflowEvent::WorkflowRetried { .. } => {
                    pass.push(Work::Activate(workflow_id.clone()));
                }
                _ => {}
            }
        }
    }

    /// Queues an advance for every other active workflow with a pending
    /// step that conflict resolution took an agent from.
    pub(super) async fn unblock(&self, released: &WorkflowId, pass: &mut Pass) {
        for workflow_id in self.inner.cache.workflows_with_status(WorkflowStatus::Active) {
            if workflow_id == *released {
                continue;
            }
            let Some(snapshot) = self.current(&workflow_id).await else {
                continue;
            };
            let waiting = snapshot
                .steps
                .values()
                .any(|step| step.status == StepStatus::Pending && !step.avoided_agents.is_empty());
            if waiting {
                pass.push(Work::Advance(workflow_id));
            }
        }
    }

    fn on_step_started(&self, snapshot: &WorkflowSnapshot, step_id: &StepId, pass: &mut Pass) {
        let Some(definition) = snapshot.definition.step(step_id) else {
            return;
        };
        let workflow_id = &snapshot.workflow_id;

        if let StepType::Synchronization { required_agents } = definition.step_type {
            let point = point_id(workflow_id, step_id);
            if let Err(error) = self
                .inner
                .coordinator
                .open_point(workflow_id, point, required_agents)
            {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    step_id = %step_id,
                    error = %error,
                    "Could not open synchronization point"
                );
            }
            return;
        }

        let iteration = snapshot.step(step_id).map_or(1, |state| state.iteration + 1);
        pass.push(Work::Dispatch(Directive::Started {
            workflow_id: workflow_id.clone(),
            step_id: step_id.clone(),
            agent_id: snapshot.assigned_agents.get(step_id).cloned(),
            iteration,
            parameters: definition.parameters.clone(),
        }));
    }
}
