//! Follow-up work after a commit.
//!
//! Reacting to a committed event never sends a command directly: it queues
//! [`Work`] on the current [`Pass`]. The pass drains its queue in order, so
//! every follow-up goes through the same actor path as the command that
//! caused it and carries that command's correlation id.

use super::ports::{Directive, ResourceAvailability, StepRequest};
use super::{StartOutcome, WorkflowEngine};
use crate::conflict::StepClaim;
use crate::consistency::{Reconciled, ReplicaState, SyncOutcome};
use crate::dependency::DependencyContext;
use crate::domain::actor::Committed;
use crate::domain::cqrs::WorkflowCommand;
use crate::domain::errors::{Rejected, WorkflowError};
use crate::domain::failure::{FailureKind, FailureSignal};
use crate::domain::snapshot::{StepState, WorkflowSnapshot};
use crate::domain::types::{
    ActiveSubstate, AgentId, StepId, StepStatus, StepType, TimestampUtc, WorkflowId,
    WorkflowStatus, WorkflowStepDefinition,
};
use crate::event_store::EventMetadata;
use crate::recovery::{RecoveryCheckpoint, RecoveryPlan};
use crate::state_machine::WorkflowTrigger;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on queued follow-ups in one pass.
const FOLLOW_UP_BUDGET: usize = 1024;

pub(super) enum Work {
    /// Start whatever became ready and move the substate along.
    Advance(WorkflowId),
    /// Activate once dependencies allow.
    Activate(WorkflowId),
    Command {
        workflow_id: WorkflowId,
        command: WorkflowCommand,
        cause: Option<Uuid>,
    },
    Checkpoint {
        workflow_id: WorkflowId,
        label: String,
        cause: Option<Uuid>,
    },
    Recover(FailureSignal),
    Dispatch(Directive),
    /// A loop iteration finished.
    Iterated {
        workflow_id: WorkflowId,
        step_id: StepId,
        output: Value,
        cause: Option<Uuid>,
    },
    Adopt(Reconciled),
    /// A workflow released what it held; re-advance workflows whose steps
    /// wait on avoided agents.
    Unblock(WorkflowId),
}

pub(super) struct Pass {
    metadata: EventMetadata,
    queue: VecDeque<Work>,
    /// Workflows changed during the pass, not yet handed to consistency.
    touched: BTreeSet<WorkflowId>,
    synced: HashSet<WorkflowId>,
    /// Workflows whose recovery plan is being applied.
    recovering: HashSet<WorkflowId>,
    /// Earliest `not_before` still in the future, per workflow.
    wake: HashMap<WorkflowId, TimestampUtc>,
}

impl Pass {
    pub(super) fn new() -> Self {
        Self {
            metadata: EventMetadata::correlated(Uuid::new_v4()),
            queue: VecDeque::new(),
            touched: BTreeSet::new(),
            synced: HashSet::new(),
            recovering: HashSet::new(),
            wake: HashMap::new(),
        }
    }

    pub(super) fn push(&mut self, work: Work) {
        if let Work::Advance(workflow_id) = &work {
            let queued = self
                .queue
                .iter()
                .any(|queued| matches!(queued, Work::Advance(id) if id == workflow_id));
            if queued {
                return;
            }
        }
        self.queue.push_back(work);
    }

    /// Keeps the workflow out of this pass's consistency round.
    pub(super) fn mark_synced(&mut self, workflow_id: &WorkflowId) {
        self.synced.insert(workflow_id.clone());
    }

    fn metadata_for(&self, cause: Option<Uuid>) -> EventMetadata {
        match cause {
            Some(event_id) => self.metadata.caused_by(event_id),
            None => self.metadata,
        }
    }

    pub(super) fn touch(&mut self, workflow_id: &WorkflowId) {
        self.touched.insert(workflow_id.clone());
    }

    pub(super) fn is_recovering(&self, workflow_id: &WorkflowId) -> bool {
        self.recovering.contains(workflow_id)
    }

    pub(super) fn wake_at(&mut self, workflow_id: &WorkflowId, at: TimestampUtc) {
        self.wake
            .entry(workflow_id.clone())
            .and_modify(|earliest| *earliest = (*earliest).min(at))
            .or_insert(at);
    }
}

/// Dependency predicates answered from engine snapshots.
pub(super) struct EngineDependencyContext<'a> {
    pub(super) snapshots: HashMap<WorkflowId, Arc<WorkflowSnapshot>>,
    pub(super) resources: &'a dyn ResourceAvailability,
}

impl DependencyContext for EngineDependencyContext<'_> {
    fn status(&self, workflow_id: &WorkflowId) -> Option<WorkflowStatus> {
        self.snapshots.get(workflow_id).map(|snapshot| snapshot.status())
    }

    fn global_context(&self, workflow_id: &WorkflowId) -> Option<&Map<String, Value>> {
        self.snapshots
            .get(workflow_id)
            .map(|snapshot| &snapshot.global_context)
    }

    fn resource_available(&self, resource: &str) -> bool {
        self.resources.is_available(resource)
    }
}

/// Substate triggers leading from `from` to `to`.
fn substate_path(from: ActiveSubstate, to: ActiveSubstate) -> Vec<WorkflowTrigger> {
    use ActiveSubstate::*;
    match (from, to) {
        (from, to) if from == to => Vec::new(),
        (_, Initializing) => Vec::new(),
        (_, Executing) => vec![WorkflowTrigger::Execute],
        (Initializing, Synchronizing) => vec![WorkflowTrigger::Execute, WorkflowTrigger::Synchronize],
        (_, Synchronizing) => vec![WorkflowTrigger::Synchronize],
        (Synchronizing, Waiting) => vec![WorkflowTrigger::Execute, WorkflowTrigger::Wait],
        (_, Waiting) => vec![WorkflowTrigger::Wait],
        (Synchronizing, Finalizing) => vec![WorkflowTrigger::Execute, WorkflowTrigger::Finalize],
        (_, Finalizing) => vec![WorkflowTrigger::Finalize],
    }
}

fn is_synchronization(snapshot: &WorkflowSnapshot, step_id: &StepId) -> bool {
    snapshot
        .definition
        .step(step_id)
        .is_some_and(|step| matches!(step.step_type, StepType::Synchronization { .. }))
}

impl WorkflowEngine {
    /// Sends `command` and queues the reactions to what it committed.
    pub(super) async fn apply(
        &self,
        workflow_id: &WorkflowId,
        command: WorkflowCommand,
        cause: Option<Uuid>,
        pass: &mut Pass,
    ) -> Result<Committed, Rejected> {
        let name = command.name();
        let outcome = self
            .send_command(workflow_id, command, pass.metadata_for(cause))
            .await;
        match &outcome {
            Ok(committed) => self.react(committed, pass),
            Err(rejected) => tracing::debug!(
                workflow_id = %workflow_id,
                command = name,
                error = %rejected.error,
                "Command rejected"
            ),
        }
        outcome
    }

    async fn apply_all(&self, workflow_id: &WorkflowId, commands: Vec<WorkflowCommand>, pass: &mut Pass) {
        for command in commands {
            if self.apply(workflow_id, command, None, pass).await.is_err() {
                break;
            }
        }
    }

    /// Drains the pass, then syncs what changed and arms retry timers.
    pub(super) async fn run(&self, pass: &mut Pass) {
        let mut budget = FOLLOW_UP_BUDGET;
        loop {
            while let Some(work) = pass.queue.pop_front() {
                if budget == 0 {
                    tracing::warn!(
                        dropped = pass.queue.len() + 1,
                        "Follow-up budget exhausted, remaining work dropped"
                    );
                    pass.queue.clear();
                    break;
                }
                budget -= 1;
                self.perform(work, pass).await;
            }
            if !self.sync_touched(pass).await {
                break;
            }
        }
        self.arm_timers(pass);
    }

    async fn perform(&self, work: Work, pass: &mut Pass) {
        match work {
            Work::Advance(workflow_id) => self.advance(&workflow_id, pass).await,
            Work::Activate(workflow_id) => {
                if let Err(rejected) = self.activate_if_ready(&workflow_id, None, pass).await {
                    tracing::debug!(workflow_id = %workflow_id, error = %rejected.error, "Activation skipped");
                }
            }
            Work::Command {
                workflow_id,
                command,
                cause,
            } => self.apply_follow_up(&workflow_id, command, cause, pass).await,
            Work::Checkpoint {
                workflow_id,
                label,
                cause,
            } => {
                if let Err(error) = self.record_checkpoint(&workflow_id, &label, cause, pass).await {
                    tracing::debug!(workflow_id = %workflow_id, label = %label, error = %error, "Checkpoint skipped");
                }
            }
            Work::Recover(signal) => {
                let workflow_id = signal.workflow_id.clone();
                if let Err(error) = self.recover(signal, pass).await {
                    tracing::warn!(workflow_id = %workflow_id, error = %error, "Recovery not applied");
                }
            }
            Work::Dispatch(directive) => self.dispatch(directive, pass).await,
            Work::Iterated {
                workflow_id,
                step_id,
                output,
                cause,
            } => self.continue_loop(&workflow_id, &step_id, output, cause, pass).await,
            Work::Adopt(reconciled) => self.adopt(reconciled, pass).await,
            Work::Unblock(released) => self.unblock(&released, pass).await,
        }
    }

    /// `apply` for follow-ups no caller waits on: a rejection is logged.
    pub(super) async fn apply_follow_up(
        &self,
        workflow_id: &WorkflowId,
        command: WorkflowCommand,
        cause: Option<Uuid>,
        pass: &mut Pass,
    ) {
        let name = command.name();
        if let Err(rejected) = self.apply(workflow_id, command, cause, pass).await {
            tracing::warn!(
                workflow_id = %workflow_id,
                command = name,
                error = %rejected.error,
                "Follow-up command rejected"
            );
        }
    }

    /// Starts ready steps of an active workflow, or completes it once every
    /// step is done.
    async fn advance(&self, workflow_id: &WorkflowId, pass: &mut Pass) {
        let Some(snapshot) = self.current(workflow_id).await else {
            return;
        };
        let Some(substate) = snapshot.substate() else {
            return;
        };

        if snapshot.all_steps_done() {
            let mut commands: Vec<WorkflowCommand> = substate_path(substate, ActiveSubstate::Finalizing)
                .into_iter()
                .map(|trigger| WorkflowCommand::ChangeSubstate { trigger })
                .collect();
            commands.push(WorkflowCommand::Complete);
            self.apply_all(workflow_id, commands, pass).await;
            return;
        }

        let now = self.inner.services.clock.now();
        let mut step_commands = Vec::new();
        let (mut starting, mut synchronizing, mut skipping) = (false, false, false);

        for definition in &snapshot.definition.steps {
            let Some(state) = snapshot.step(&definition.id) else {
                continue;
            };
            if state.status != StepStatus::Pending || !snapshot.dependencies_done(&definition.id) {
                continue;
            }
            if let Some(not_before) = state.not_before {
                if not_before > now {
                    pass.wake_at(workflow_id, not_before);
                    continue;
                }
            }

            match &definition.step_type {
                StepType::Conditional { condition } if !condition.evaluate(&snapshot.global_context) => {
                    step_commands.push(WorkflowCommand::SkipStep {
                        step_id: definition.id.clone(),
                        reason: "condition not met".to_string(),
                    });
                    skipping = true;
                    continue;
                }
                StepType::Synchronization { .. } => {
                    step_commands.push(WorkflowCommand::StartStep {
                        step_id: definition.id.clone(),
                    });
                    synchronizing = true;
                    continue;
                }
                _ => {}
            }

            let Some(agent_id) = self.choose_agent(&snapshot, definition, state).await else {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    step_id = %definition.id,
                    "No agent available for ready step"
                );
                continue;
            };
            if snapshot.assigned_agents.get(&definition.id) != Some(&agent_id) {
                step_commands.push(WorkflowCommand::AssignStep {
                    step_id: definition.id.clone(),
                    agent_id,
                });
            }
            step_commands.push(WorkflowCommand::StartStep {
                step_id: definition.id.clone(),
            });
            starting = true;
        }

        let running_sync = snapshot
            .running_steps()
            .any(|(step_id, _)| is_synchronization(&snapshot, step_id));
        let running = snapshot.running_steps().next().is_some();
        let target = if synchronizing || running_sync {
            ActiveSubstate::Synchronizing
        } else if starting || running {
            ActiveSubstate::Executing
        } else if skipping {
            substate
        } else {
            ActiveSubstate::Waiting
        };

        let mut commands: Vec<WorkflowCommand> = substate_path(substate, target)
            .into_iter()
            .map(|trigger| WorkflowCommand::ChangeSubstate { trigger })
            .collect();
        commands.extend(step_commands);
        self.apply_all(workflow_id, commands, pass).await;
    }

    /// Explicit assignment first, then the pinned agent unless it was
    /// released from this step, then the selector. A step left with only
    /// avoided agents takes one back once it no longer conflicts.
    async fn choose_agent(
        &self,
        snapshot: &WorkflowSnapshot,
        definition: &WorkflowStepDefinition,
        state: &StepState,
    ) -> Option<AgentId> {
        if let Some(agent_id) = snapshot.assigned_agents.get(&definition.id) {
            return Some(agent_id.clone());
        }
        if let Some(agent_id) = &definition.agent {
            if !state.avoided_agents.contains(agent_id) {
                return Some(agent_id.clone());
            }
        }

        let candidates: Vec<AgentId> = snapshot
            .definition
            .candidate_agents
            .iter()
            .filter(|agent_id| !state.avoided_agents.contains(*agent_id))
            .cloned()
            .collect();
        let request = StepRequest {
            workflow_id: snapshot.workflow_id.clone(),
            step: definition.clone(),
            candidates,
            priority: snapshot.definition.priority,
            attempt: state.attempts,
        };
        let selected = self
            .inner
            .selector
            .select(&request)
            .await
            .filter(|agent_id| !state.avoided_agents.contains(agent_id));
        if selected.is_some() || state.avoided_agents.is_empty() {
            return selected;
        }
        self.reclaim_avoided(snapshot, definition, state).await
    }

    async fn reclaim_avoided(
        &self,
        snapshot: &WorkflowSnapshot,
        definition: &WorkflowStepDefinition,
        state: &StepState,
    ) -> Option<AgentId> {
        let live = self.live_snapshots().await;
        let pinned = definition
            .agent
            .iter()
            .filter(|agent_id| state.avoided_agents.contains(*agent_id));
        let others = state
            .avoided_agents
            .iter()
            .filter(|agent_id| definition.agent.as_ref() != Some(*agent_id));
        for agent_id in pinned.chain(others) {
            let claim = StepClaim::prospective(snapshot, definition, agent_id);
            if !self.inner.detector.would_conflict(&claim, &live) {
                tracing::info!(
                    workflow_id = %snapshot.workflow_id,
                    step_id = %definition.id,
                    agent_id = %agent_id,
                    "Contention cleared, avoided agent taken back"
                );
                return Some(agent_id.clone());
            }
        }
        None
    }

    async fn continue_loop(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        output: Value,
        cause: Option<Uuid>,
        pass: &mut Pass,
    ) {
        let Some(snapshot) = self.current(workflow_id).await else {
            return;
        };
        let (Some(state), Some(definition)) = (snapshot.step(step_id), snapshot.definition.step(step_id)) else {
            return;
        };
        let StepType::Loop { max_iterations, until } = &definition.step_type else {
            return;
        };
        if state.status != StepStatus::Running {
            return;
        }

        let finished = state.iteration >= *max_iterations
            || until
                .as_ref()
                .is_some_and(|condition| condition.evaluate(&snapshot.global_context));
        if finished {
            tracing::debug!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                iterations = state.iteration,
                "Loop finished"
            );
            let command = WorkflowCommand::CompleteStep {
                step_id: step_id.clone(),
                result: output,
            };
            self.apply_follow_up(workflow_id, command, cause, pass).await;
            return;
        }

        pass.push(Work::Dispatch(Directive::Started {
            workflow_id: workflow_id.clone(),
            step_id: step_id.clone(),
            agent_id: snapshot.assigned_agents.get(step_id).cloned(),
            iteration: state.iteration + 1,
            parameters: definition.parameters.clone(),
        }));
    }

    pub(super) async fn activate_if_ready(
        &self,
        workflow_id: &WorkflowId,
        cause: Option<Uuid>,
        pass: &mut Pass,
    ) -> Result<StartOutcome, Rejected> {
        let Some(snapshot) = self.current(workflow_id).await else {
            return Err(WorkflowError::NotFound(workflow_id.clone()).into());
        };

        if snapshot.status() == WorkflowStatus::Pending {
            let resolution = self.resolve_dependencies(workflow_id).await;
            if !resolution.is_satisfied() {
                let reasons = resolution.reasons();
                tracing::info!(
                    workflow_id = %workflow_id,
                    unmet = reasons.len(),
                    "Activation deferred on unmet dependencies"
                );
                self.inner.deferred.insert(workflow_id.clone(), reasons.clone());
                return Ok(StartOutcome::Deferred { snapshot, reasons });
            }
        }

        self.inner.deferred.remove(workflow_id);
        let committed = self
            .apply(workflow_id, WorkflowCommand::Activate, cause, pass)
            .await?;
        Ok(StartOutcome::Activated(committed.snapshot))
    }

    pub(super) async fn record_checkpoint(
        &self,
        workflow_id: &WorkflowId,
        label: &str,
        cause: Option<Uuid>,
        pass: &mut Pass,
    ) -> Result<RecoveryCheckpoint, WorkflowError> {
        let snapshot = self
            .current(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.clone()))?;
        if !matches!(snapshot.status(), WorkflowStatus::Active | WorkflowStatus::Paused) {
            return Err(WorkflowError::InvalidTransition {
                state: snapshot.phase.to_string(),
                trigger: "record_checkpoint".to_string(),
            });
        }

        let checkpoint = self.inner.recovery.checkpoint(&snapshot, label).await?;
        let command = WorkflowCommand::RecordCheckpoint {
            checkpoint_id: checkpoint.id,
        };
        self.apply(workflow_id, command, cause, pass)
            .await
            .map_err(|rejected| rejected.error)?;
        Ok(checkpoint)
    }

    /// Plans recovery and applies the plan's commands in order, stopping at
    /// the first rejection. Agents whose step was taken away are cancelled.
    pub(super) async fn recover(&self, signal: FailureSignal, pass: &mut Pass) -> Result<RecoveryPlan, WorkflowError> {
        let workflow_id = signal.workflow_id.clone();
        let snapshot = self
            .current(&workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.clone()))?;
        let running_before: Vec<(StepId, Option<AgentId>)> = snapshot
            .running_steps()
            .map(|(step_id, agent_id)| (step_id.clone(), agent_id.cloned()))
            .collect();

        let plan = self.inner.recovery.plan(&snapshot, signal).await?;

        pass.recovering.insert(workflow_id.clone());
        let mut applied = 0;
        for command in plan.commands.iter().cloned() {
            if self.apply(&workflow_id, command, None, pass).await.is_err() {
                break;
            }
            applied += 1;
        }
        pass.recovering.remove(&workflow_id);
        if applied < plan.commands.len() {
            tracing::warn!(
                workflow_id = %workflow_id,
                strategy = %plan.strategy,
                applied,
                planned = plan.commands.len(),
                "Recovery plan applied partially"
            );
        }

        if let Some(after) = self.current(&workflow_id).await {
            for (step_id, agent_id) in running_before {
                let still_running = after.step_status(&step_id) == Some(StepStatus::Running)
                    && after.assigned_agents.get(&step_id) == agent_id.as_ref();
                if !still_running {
                    pass.push(Work::Dispatch(Directive::Cancel {
                        workflow_id: workflow_id.clone(),
                        step_id,
                        agent_id,
                        reason: format!("recovery: {}", plan.strategy),
                    }));
                }
            }
        }
        pass.push(Work::Advance(workflow_id));
        Ok(plan)
    }

    /// Undeliverable start directives are step failures.
    async fn dispatch(&self, directive: Directive, pass: &mut Pass) {
        let name = directive.name();
        let workflow_id = directive.workflow_id().clone();
        let step_id = directive.step_id().clone();
        let started = matches!(directive, Directive::Started { .. });

        if let Err(error) = self.inner.adapter.dispatch(directive).await {
            tracing::warn!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                directive = name,
                error = %error,
                "Directive not delivered"
            );
            if started {
                let signal = FailureSignal::new(
                    workflow_id,
                    FailureKind::Transport,
                    format!("start directive for {step_id} not delivered: {error}"),
                )
                .for_step(step_id);
                pass.push(Work::Recover(signal));
            }
        }
    }

    /// Hands every workflow touched in this pass to the consistency
    /// manager once. Returns whether that queued more work.
    async fn sync_touched(&self, pass: &mut Pass) -> bool {
        let Some(manager) = self.inner.consistency.clone() else {
            pass.touched.clear();
            return false;
        };
        let touched = std::mem::take(&mut pass.touched);
        for workflow_id in touched {
            if !pass.synced.insert(workflow_id.clone()) {
                continue;
            }
            let Some(snapshot) = self.current(&workflow_id).await else {
                continue;
            };
            match manager.sync(ReplicaState::from_snapshot(&snapshot)).await {
                Ok(SyncOutcome::Reconciled(reconciled)) => {
                    if reconciled.adopt {
                        pass.push(Work::Adopt(reconciled));
                    }
                }
                Ok(SyncOutcome::Queued) => {}
                Err(error) if snapshot.status().is_terminal() => {
                    tracing::warn!(workflow_id = %workflow_id, error = %error, "Final state not synchronized");
                }
                Err(error) => {
                    pass.push(Work::Recover(FailureSignal::new(
                        workflow_id,
                        FailureKind::Transport,
                        error.to_string(),
                    )));
                }
            }
        }
        !pass.queue.is_empty()
    }

    /// Adopts an agreed state unless the workflow moved on since.
    pub(super) async fn adopt(&self, reconciled: Reconciled, pass: &mut Pass) {
        if !reconciled.adopt {
            return;
        }
        let workflow_id = reconciled.workflow_id.clone();
        let Some(snapshot) = self.current(&workflow_id).await else {
            return;
        };
        if snapshot.sequence != reconciled.local_version || snapshot.status().is_terminal() {
            tracing::debug!(
                workflow_id = %workflow_id,
                local_version = reconciled.local_version,
                sequence = snapshot.sequence,
                "Stale reconciliation ignored"
            );
            return;
        }
        let command = WorkflowCommand::AdoptReplica {
            remote_version: reconciled.state.version,
            merged: reconciled.state.merged,
            state: reconciled.state.state,
        };
        self.apply_follow_up(&workflow_id, command, None, pass).await;
    }

    /// Re-advances workflows once their earliest `not_before` passes.
    fn arm_timers(&self, pass: &mut Pass) {
        if pass.wake.is_empty() || self.is_stopped() {
            pass.wake.clear();
            return;
        }
        let now = self.inner.services.clock.now();
        for (workflow_id, at) in pass.wake.drain() {
            let delay = Duration::from_millis(at.millis_since(&now).saturating_add(1));
            let engine = self.clone();
            let mut shutdown = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => engine.nudge(workflow_id).await,
                    _ = shutdown.changed() => {}
                }
            });
        }
    }

    async fn nudge(&self, workflow_id: WorkflowId) {
        if self.is_stopped() {
            return;
        }
        let mut pass = Pass::new();
        pass.push(Work::Advance(workflow_id));
        self.run(&mut pass).await;
    }
}
