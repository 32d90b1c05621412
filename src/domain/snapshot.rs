//! Materialized workflow state.
//!
//! A [`WorkflowSnapshot`] is never mutated directly by callers: it only
//! changes through [`WorkflowSnapshot::apply`], which is a pure function of
//! the current snapshot and the next event.

use crate::domain::cqrs::events::WorkflowEvent;
use crate::domain::types::{
    ActiveSubstate, AgentId, StepId, StepStatus, TimestampUtc, WorkflowDefinition, WorkflowId,
    WorkflowStatus,
};
use crate::state_machine::{
    step_transition, transition, StepTrigger, WorkflowPhase, WorkflowTrigger,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Context key under which step results are published.
pub const OUTPUTS_KEY: &str = "outputs";

/// Per-step execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub not_before: Option<TimestampUtc>,
    #[serde(default)]
    pub started_at: Option<TimestampUtc>,
    /// Agents released from this step by conflict resolution, until it
    /// starts again.
    #[serde(default)]
    pub avoided_agents: BTreeSet<AgentId>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            iteration: 0,
            result: None,
            error: None,
            not_before: None,
            started_at: None,
            avoided_agents: BTreeSet::new(),
        }
    }
}

/// The mutable part of a snapshot: what checkpoints capture and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub phase: WorkflowPhase,
    pub steps: BTreeMap<StepId, StepState>,
    pub assigned_agents: BTreeMap<StepId, AgentId>,
    pub global_context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub definition: WorkflowDefinition,
    pub phase: WorkflowPhase,
    pub steps: BTreeMap<StepId, StepState>,
    pub assigned_agents: BTreeMap<StepId, AgentId>,
    pub global_context: Map<String, Value>,
    /// Sequence of the last applied event.
    pub sequence: u64,
    /// Number of explicit workflow-level retries.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub recoveries: u32,
    #[serde(default)]
    pub last_checkpoint: Option<Uuid>,
    pub created_at: TimestampUtc,
    pub updated_at: TimestampUtc,
    #[serde(default)]
    pub activated_at: Option<TimestampUtc>,
}

impl WorkflowSnapshot {
    /// First snapshot, materialized by `WorkflowCreated` at sequence 1.
    pub fn created(definition: WorkflowDefinition, created_at: TimestampUtc) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepState::default()))
            .collect();
        Self {
            workflow_id: definition.id.clone(),
            global_context: definition.parameters.clone(),
            definition,
            phase: WorkflowPhase::Pending,
            steps,
            assigned_agents: BTreeMap::new(),
            sequence: 1,
            attempt: 0,
            recoveries: 0,
            last_checkpoint: None,
            created_at,
            updated_at: created_at,
            activated_at: None,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.phase.status()
    }

    pub fn substate(&self) -> Option<ActiveSubstate> {
        self.phase.substate()
    }

    pub fn step(&self, id: &StepId) -> Option<&StepState> {
        self.steps.get(id)
    }

    pub fn step_status(&self, id: &StepId) -> Option<StepStatus> {
        self.steps.get(id).map(|step| step.status)
    }

    /// Running steps with their assigned agent (if any).
    pub fn running_steps(&self) -> impl Iterator<Item = (&StepId, Option<&AgentId>)> {
        self.steps
            .iter()
            .filter(|(_, state)| state.status == StepStatus::Running)
            .map(|(id, _)| (id, self.assigned_agents.get(id)))
    }

    /// Every step is completed or skipped.
    pub fn all_steps_done(&self) -> bool {
        self.steps.values().all(|step| step.status.is_done())
    }

    /// Whether all declared and implicit dependencies of `id` are done.
    pub fn dependencies_done(&self, id: &StepId) -> bool {
        self.definition
            .effective_dependencies(id)
            .iter()
            .all(|dep| self.step_status(dep).is_some_and(|status| status.is_done()))
    }

    pub fn execution_state(&self) -> ExecutionState {
        ExecutionState {
            phase: self.phase,
            steps: self.steps.clone(),
            assigned_agents: self.assigned_agents.clone(),
            global_context: self.global_context.clone(),
        }
    }

    fn restore_execution(&mut self, state: &ExecutionState) {
        self.phase = state.phase;
        self.steps = state.steps.clone();
        self.assigned_agents = state.assigned_agents.clone();
        self.global_context = state.global_context.clone();
    }

    fn fire(&mut self, trigger: WorkflowTrigger) {
        if let Ok(next) = transition(self.phase, trigger) {
            self.phase = next;
        }
    }

    fn fire_step(&mut self, step_id: &StepId, trigger: StepTrigger) -> bool {
        let Some(step) = self.steps.get_mut(step_id) else {
            return false;
        };
        match step_transition(step.status, trigger) {
            Ok(next) => {
                step.status = next;
                true
            }
            Err(_) => false,
        }
    }

    fn publish_output(&mut self, step_id: &StepId, value: Value) {
        let outputs = self
            .global_context
            .entry(OUTPUTS_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !outputs.is_object() {
            *outputs = Value::Object(Map::new());
        }
        if let Value::Object(map) = outputs {
            map.insert(step_id.as_str().to_string(), value);
        }
    }

    fn retract_output(&mut self, step_id: &StepId) {
        if let Some(Value::Object(map)) = self.global_context.get_mut(OUTPUTS_KEY) {
            map.remove(step_id.as_str());
        }
    }

    /// Applies one event. Pure and deterministic: the result depends only on
    /// `self` and `event`.
    pub fn apply(&mut self, event: &WorkflowEvent) {
        self.sequence += 1;

        match event {
            WorkflowEvent::WorkflowCreated { created_at, .. } => {
                self.updated_at = *created_at;
            }
            WorkflowEvent::WorkflowActivated { activated_at } => {
                self.fire(WorkflowTrigger::Activate);
                self.activated_at = Some(*activated_at);
                self.updated_at = *activated_at;
            }
            WorkflowEvent::SubstateChanged {
                substate,
                changed_at,
                ..
            } => {
                if self.status() == WorkflowStatus::Active {
                    self.phase = WorkflowPhase::Active {
                        substate: *substate,
                    };
                }
                self.updated_at = *changed_at;
            }
            WorkflowEvent::WorkflowPaused { paused_at, .. } => {
                self.fire(WorkflowTrigger::Pause);
                self.updated_at = *paused_at;
            }
            WorkflowEvent::WorkflowResumed { resumed_at } => {
                self.fire(WorkflowTrigger::Resume);
                self.updated_at = *resumed_at;
            }
            WorkflowEvent::WorkflowCompleted { completed_at } => {
                self.fire(WorkflowTrigger::Complete);
                self.updated_at = *completed_at;
            }
            WorkflowEvent::WorkflowFailed { failed_at, .. } => {
                self.fire(WorkflowTrigger::Fail);
                self.updated_at = *failed_at;
            }
            WorkflowEvent::WorkflowCancelled { cancelled_at, .. } => {
                self.fire(WorkflowTrigger::Cancel);
                self.updated_at = *cancelled_at;
            }
            WorkflowEvent::WorkflowRetried {
                attempt,
                retried_at,
            } => {
                self.fire(WorkflowTrigger::Retry);
                self.attempt = *attempt;
                for (id, step) in self.steps.iter_mut() {
                    if !step.status.is_done() {
                        step.status = StepStatus::Pending;
                        step.error = None;
                        step.started_at = None;
                        step.not_before = None;
                        self.assigned_agents.remove(id);
                    }
                }
                self.updated_at = *retried_at;
            }

            WorkflowEvent::StepAssigned {
                step_id,
                agent_id,
                assigned_at,
            } => {
                if self.steps.contains_key(step_id) {
                    self.assigned_agents
                        .insert(step_id.clone(), agent_id.clone());
                }
                self.updated_at = *assigned_at;
            }
            WorkflowEvent::StepStarted {
                step_id,
                started_at,
            } => {
                if self.fire_step(step_id, StepTrigger::Start) {
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.started_at = Some(*started_at);
                        step.not_before = None;
                        step.avoided_agents.clear();
                    }
                }
                self.updated_at = *started_at;
            }
            WorkflowEvent::StepIterationCompleted {
                step_id,
                iteration,
                output,
                completed_at,
            } => {
                if self.fire_step(step_id, StepTrigger::Iterate) {
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.iteration = *iteration;
                    }
                    self.publish_output(step_id, output.clone());
                }
                self.updated_at = *completed_at;
            }
            WorkflowEvent::StepCompleted {
                step_id,
                result,
                completed_at,
            } => {
                if self.fire_step(step_id, StepTrigger::Complete) {
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.result = Some(result.clone());
                        step.error = None;
                    }
                    self.publish_output(step_id, result.clone());
                }
                self.updated_at = *completed_at;
            }
            WorkflowEvent::StepFailed {
                step_id,
                error,
                failed_at,
            } => {
                if self.fire_step(step_id, StepTrigger::Fail) {
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.error = Some(error.clone());
                    }
                }
                self.updated_at = *failed_at;
            }
            WorkflowEvent::StepSkipped {
                step_id,
                skipped_at,
                ..
            } => {
                self.fire_step(step_id, StepTrigger::Skip);
                self.updated_at = *skipped_at;
            }
            WorkflowEvent::StepPreempted {
                step_id,
                released_agent,
                preempted_at,
                ..
            } => {
                if self.fire_step(step_id, StepTrigger::Preempt) {
                    self.assigned_agents.remove(step_id);
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.started_at = None;
                        if let Some(agent) = released_agent {
                            step.avoided_agents.insert(agent.clone());
                        }
                    }
                }
                self.updated_at = *preempted_at;
            }
            WorkflowEvent::StepRescheduled {
                step_id,
                not_before,
                rescheduled_at,
                ..
            } => {
                if self.fire_step(step_id, StepTrigger::Preempt) {
                    self.assigned_agents.remove(step_id);
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.started_at = None;
                        step.not_before = Some(*not_before);
                    }
                }
                self.updated_at = *rescheduled_at;
            }
            WorkflowEvent::StepRetried {
                step_id,
                attempt,
                not_before,
                retried_at,
            } => {
                if self.fire_step(step_id, StepTrigger::Retry) {
                    self.assigned_agents.remove(step_id);
                    if let Some(step) = self.steps.get_mut(step_id) {
                        step.attempts = *attempt;
                        step.not_before = Some(*not_before);
                        step.error = None;
                        step.started_at = None;
                    }
                }
                self.updated_at = *retried_at;
            }

            WorkflowEvent::ContextUpdated {
                updates,
                updated_at,
            } => {
                for (key, value) in updates {
                    self.global_context.insert(key.clone(), value.clone());
                }
                self.updated_at = *updated_at;
            }
            WorkflowEvent::CheckpointRecorded {
                checkpoint_id,
                recorded_at,
            } => {
                self.last_checkpoint = Some(*checkpoint_id);
                self.updated_at = *recorded_at;
            }

            WorkflowEvent::RecoveryInitiated { initiated_at, .. } => {
                self.recoveries += 1;
                self.updated_at = *initiated_at;
            }
            WorkflowEvent::CheckpointRestored {
                checkpoint_id,
                state,
                restored_at,
            } => {
                self.restore_execution(state);
                self.last_checkpoint = Some(*checkpoint_id);
                self.updated_at = *restored_at;
            }
            WorkflowEvent::PartialRollbackApplied {
                steps, applied_at, ..
            } => {
                for (step_id, state) in steps {
                    if !self.steps.contains_key(step_id) {
                        continue;
                    }
                    self.steps.insert(step_id.clone(), state.clone());
                    self.assigned_agents.remove(step_id);
                    match &state.result {
                        Some(result) if state.status.is_done() => {
                            self.publish_output(step_id, result.clone())
                        }
                        _ => self.retract_output(step_id),
                    }
                }
                self.updated_at = *applied_at;
            }
            WorkflowEvent::EscalatedToManual { escalated_at, .. } => {
                self.fire(WorkflowTrigger::Escalate);
                self.updated_at = *escalated_at;
            }
            WorkflowEvent::ManualResolutionApplied { resolved_at, .. } => {
                self.fire(WorkflowTrigger::ResolveManually);
                self.updated_at = *resolved_at;
            }
            WorkflowEvent::ConflictEscalated { escalated_at, .. } => {
                self.fire(WorkflowTrigger::Escalate);
                self.updated_at = *escalated_at;
            }
            WorkflowEvent::ReplicaReconciled {
                state,
                reconciled_at,
                ..
            } => {
                self.restore_execution(state);
                self.updated_at = *reconciled_at;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;
