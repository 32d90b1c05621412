//! The workflow engine facade.
//!
//! [`WorkflowEngine`] wires the event store, cache, per-workflow actors and
//! the coordination, conflict, recovery and consistency components into one
//! handle. Every state change goes through a workflow's actor; the engine
//! then reacts to what was committed (starting ready steps, recording
//! checkpoints, routing failures to recovery) inside a single pass.
//!
//! ```ignore
//! let engine = WorkflowEngine::builder(Arc::new(MySelector)).start().await?;
//! engine.create(definition).await?;
//! engine.start(&workflow_id).await?;
//! ```

mod builder;
mod handlers;
mod orchestration;
mod ports;
mod reactions;
mod tasks;

pub use builder::WorkflowEngineBuilder;
pub use handlers::{EventHandler, HandlerRegistry, LifecycleHandler, LIFECYCLE_KINDS};
pub use ports::{
    AgentSelector, AlwaysAvailable, ChannelAdapter, Directive, ExecutionAdapter, LifecycleEvent,
    LifecycleSink, LoggingAdapter, ResourceAvailability, StepRequest, TracingSink,
};

use crate::cache::TieredCache;
use crate::config::EngineConfig;
use crate::conflict::{ConflictDetector, ConflictOutcome, ConflictResolver};
use crate::consistency::{ConsistencyEvent, ConsistencyManager, Reconciled, ReplicaState};
use crate::coordination::{Arrival, BarrierRelease, CoordinationProtocol, MultiAgentCoordinator};
use crate::dependency::{DependencyGraph, DependencyResolution, WorkflowDependency};
use crate::domain::actor::{CommandEnvelope, CommandOutcome, Committed, WorkflowActorArgs, WorkflowMessage};
use crate::domain::cqrs::WorkflowCommand;
use crate::domain::errors::{Rejected, StorageError, WorkflowError};
use crate::domain::failure::{FailureKind, FailureSignal};
use crate::domain::services::WorkflowServices;
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::supervisor::SupervisorMsg;
use crate::domain::types::{AgentId, StepId, StepStatus, WorkflowDefinition, WorkflowId, WorkflowStatus};
use crate::event_store::{EventMetadata, RecordedEvent, WorkflowEventStore};
use crate::recovery::{RecoveryCheckpoint, RecoveryManager, RecoveryPlan};
use dashmap::{DashMap, DashSet};
use orchestration::{Pass, Work};
use parking_lot::Mutex;
use ractor::ActorRef;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

/// Synchronization point backing a synchronization step.
pub fn point_id(workflow_id: &WorkflowId, step_id: &StepId) -> String {
    format!("{workflow_id}/{step_id}")
}

/// Result of asking the engine to start a workflow.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Activated(Arc<WorkflowSnapshot>),
    /// Upstream dependencies are unmet; the engine retries on its own.
    Deferred {
        snapshot: Arc<WorkflowSnapshot>,
        reasons: Vec<String>,
    },
}

impl StartOutcome {
    pub fn snapshot(&self) -> &Arc<WorkflowSnapshot> {
        match self {
            StartOutcome::Activated(snapshot) | StartOutcome::Deferred { snapshot, .. } => snapshot,
        }
    }

    pub fn is_activated(&self) -> bool {
        matches!(self, StartOutcome::Activated(_))
    }
}

struct EngineInner {
    config: EngineConfig,
    services: WorkflowServices,
    store: WorkflowEventStore,
    cache: Arc<TieredCache>,
    graph: DependencyGraph,
    coordinator: MultiAgentCoordinator,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    recovery: RecoveryManager,
    consistency: Option<Arc<ConsistencyManager>>,
    supervisor: ActorRef<SupervisorMsg>,
    supervisor_handle: Mutex<Option<JoinHandle<()>>>,
    selector: Arc<dyn AgentSelector>,
    adapter: Arc<dyn ExecutionAdapter>,
    resources: Arc<dyn ResourceAvailability>,
    handlers: HandlerRegistry,
    event_tx: broadcast::Sender<RecordedEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    /// Workflows with a running actor.
    live: DashSet<WorkflowId>,
    /// Workflows whose start waits on unmet dependencies, with the reasons.
    deferred: DashMap<WorkflowId, Vec<String>>,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder(selector: Arc<dyn AgentSelector>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(selector)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &WorkflowEventStore {
        &self.inner.store
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.inner.cache
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    pub fn coordinator(&self) -> &MultiAgentCoordinator {
        &self.inner.coordinator
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.inner.recovery
    }

    pub fn consistency(&self) -> Option<&Arc<ConsistencyManager>> {
        self.inner.consistency.as_ref()
    }

    /// Every committed event, as it is committed.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Workflows waiting on dependencies, with the unmet reasons.
    pub fn deferred(&self) -> Vec<(WorkflowId, Vec<String>)> {
        let mut deferred: Vec<_> = self
            .inner
            .deferred
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        deferred.sort_by(|a, b| a.0.cmp(&b.0));
        deferred
    }

    // --- Lifecycle -------------------------------------------------------

    pub async fn create(&self, definition: WorkflowDefinition) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let workflow_id = definition.id.clone();
        let snapshot = self
            .execute(&workflow_id, WorkflowCommand::CreateWorkflow { definition })
            .await?;
        self.inner.graph.add_workflow(&workflow_id);
        Ok(snapshot)
    }

    /// Activates the workflow if its dependencies allow, and drives its
    /// first ready steps.
    pub async fn start(&self, workflow_id: &WorkflowId) -> Result<StartOutcome, Rejected> {
        self.ensure_running()?;
        let mut pass = Pass::new();
        let outcome = self.activate_if_ready(workflow_id, None, &mut pass).await?;
        self.run(&mut pass).await;
        Ok(match outcome {
            StartOutcome::Activated(snapshot) => {
                StartOutcome::Activated(self.current(workflow_id).await.unwrap_or(snapshot))
            }
            deferred => deferred,
        })
    }

    pub async fn pause(&self, workflow_id: &WorkflowId, reason: impl Into<String>) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let reason = reason.into();
        self.execute(workflow_id, WorkflowCommand::Pause { reason }).await
    }

    pub async fn resume(&self, workflow_id: &WorkflowId) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        self.execute(workflow_id, WorkflowCommand::Resume).await
    }

    /// Running steps are told to stop; their agents get a cancel directive.
    pub async fn cancel(&self, workflow_id: &WorkflowId, reason: impl Into<String>) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let reason = reason.into();
        self.execute(workflow_id, WorkflowCommand::Cancel { reason }).await
    }

    /// Moves a failed workflow back to pending and starts it again.
    pub async fn retry(&self, workflow_id: &WorkflowId) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        self.execute(workflow_id, WorkflowCommand::RetryWorkflow).await
    }

    pub async fn resolve_manually(&self, workflow_id: &WorkflowId, note: impl Into<String>) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let note = note.into();
        self.execute(workflow_id, WorkflowCommand::ResolveManually { note }).await
    }

    pub async fn update_context(&self, workflow_id: &WorkflowId, updates: Map<String, Value>) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        self.execute(workflow_id, WorkflowCommand::UpdateContext { updates }).await
    }

    /// Explicit placement; wins over the selector for this step.
    pub async fn assign_step(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        agent_id: &AgentId,
    ) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let command = WorkflowCommand::AssignStep {
            step_id: step_id.clone(),
            agent_id: agent_id.clone(),
        };
        self.execute(workflow_id, command).await
    }

    // --- Step results ----------------------------------------------------

    pub async fn complete_step(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        result: Value,
    ) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let command = WorkflowCommand::CompleteStep {
            step_id: step_id.clone(),
            result,
        };
        self.execute(workflow_id, command).await
    }

    /// Records the failure and routes it to recovery before returning.
    pub async fn fail_step(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        error: impl Into<String>,
    ) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let command = WorkflowCommand::FailStep {
            step_id: step_id.clone(),
            error: error.into(),
        };
        self.execute(workflow_id, command).await
    }

    /// Reports one finished loop iteration. The engine starts the next one
    /// or completes the step.
    pub async fn complete_iteration(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        output: Value,
    ) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let command = WorkflowCommand::CompleteIteration {
            step_id: step_id.clone(),
            output,
        };
        self.execute(workflow_id, command).await
    }

    // --- Coordination ----------------------------------------------------

    pub fn configure_coordination(&self, workflow_id: &WorkflowId, protocol: CoordinationProtocol) {
        self.inner.coordinator.configure_workflow(workflow_id, protocol);
    }

    /// An agent reached a synchronization step.
    pub async fn arrive(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        agent_id: &AgentId,
    ) -> Result<Arrival, Rejected> {
        self.arrive_at(workflow_id, step_id, agent_id, None).await
    }

    /// Arrival carrying a bid, for market-based coordination.
    pub async fn arrive_with_bid(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        agent_id: &AgentId,
        bid: f64,
    ) -> Result<Arrival, Rejected> {
        self.arrive_at(workflow_id, step_id, agent_id, Some(bid)).await
    }

    async fn arrive_at(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        agent_id: &AgentId,
        bid: Option<f64>,
    ) -> Result<Arrival, Rejected> {
        self.ensure_running()?;
        let snapshot = self.snapshot(workflow_id).await?;
        if snapshot.status() != WorkflowStatus::Active {
            let error = WorkflowError::InvalidTransition {
                state: snapshot.phase.to_string(),
                trigger: "arrive".to_string(),
            };
            return Err(Rejected::new(error, Some(snapshot)));
        }
        let point = point_id(workflow_id, step_id);
        let arrival = match bid {
            Some(bid) => self.inner.coordinator.arrive_with_bid(&point, agent_id, bid),
            None => self.inner.coordinator.arrive(&point, agent_id),
        };
        let arrival = match arrival {
            Ok(arrival) => arrival,
            Err(error) => return Err(self.rejected(error, workflow_id)),
        };
        if let Arrival::Released(release) = &arrival {
            self.release_barrier(workflow_id, step_id, release).await?;
        }
        Ok(arrival)
    }

    /// Completes the synchronization step, then lets the agents proceed.
    /// When the completion is rejected nobody proceeds, and a step still
    /// running gets a fresh point its agents must arrive at again.
    async fn release_barrier(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        release: &BarrierRelease,
    ) -> Result<(), Rejected> {
        self.inner.coordinator.close_point(&release.point_id);

        let mut pass = Pass::new();
        let result = json!({
            "phase": release.phase,
            "protocol": release.protocol,
            "participants": release.participants,
        });
        let command = WorkflowCommand::CompleteStep {
            step_id: step_id.clone(),
            result,
        };
        if let Err(rejected) = self.apply(workflow_id, command, None, &mut pass).await {
            tracing::warn!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                error = %rejected.error,
                "Barrier release not committed, agents held"
            );
            self.reopen_point(workflow_id, step_id, release);
            self.run(&mut pass).await;
            return Err(rejected);
        }

        tracing::info!(
            workflow_id = %workflow_id,
            step_id = %step_id,
            protocol = %release.protocol,
            participants = release.participants.len(),
            "Synchronization point released"
        );
        for directive in &release.directives {
            pass.push(Work::Dispatch(Directive::Proceed {
                workflow_id: workflow_id.clone(),
                step_id: step_id.clone(),
                point_id: release.point_id.clone(),
                directive: directive.clone(),
            }));
        }
        self.run(&mut pass).await;
        Ok(())
    }

    fn reopen_point(&self, workflow_id: &WorkflowId, step_id: &StepId, release: &BarrierRelease) {
        let running = self
            .inner
            .cache
            .peek(workflow_id)
            .is_some_and(|snapshot| {
                !snapshot.status().is_terminal() && snapshot.step_status(step_id) == Some(StepStatus::Running)
            });
        if !running {
            return;
        }
        if let Err(error) = self.inner.coordinator.open_point(
            workflow_id,
            release.point_id.clone(),
            release.participants.len(),
        ) {
            tracing::warn!(point_id = %release.point_id, error = %error, "Could not reopen synchronization point");
        }
    }

    // --- Failures, conflicts, checkpoints --------------------------------

    /// Plans and applies recovery for an externally detected failure.
    pub async fn report_failure(&self, signal: FailureSignal) -> Result<RecoveryPlan, Rejected> {
        self.ensure_running()?;
        let workflow_id = signal.workflow_id.clone();
        let mut pass = Pass::new();
        let plan = match self.recover(signal, &mut pass).await {
            Ok(plan) => plan,
            Err(error) => return Err(self.rejected(error, &workflow_id)),
        };
        self.run(&mut pass).await;
        Ok(plan)
    }

    /// Captures a verified checkpoint outside the automatic ones.
    pub async fn checkpoint(
        &self,
        workflow_id: &WorkflowId,
        label: impl Into<String>,
    ) -> Result<RecoveryCheckpoint, Rejected> {
        self.ensure_running()?;
        let label = label.into();
        let mut pass = Pass::new();
        let checkpoint = match self.record_checkpoint(workflow_id, &label, None, &mut pass).await {
            Ok(checkpoint) => checkpoint,
            Err(error) => return Err(self.rejected(error, workflow_id)),
        };
        self.run(&mut pass).await;
        Ok(checkpoint)
    }

    /// One detection and resolution pass over active and paused workflows.
    pub async fn scan_conflicts(&self) -> Vec<ConflictOutcome> {
        if self.is_stopped() {
            return Vec::new();
        }
        let snapshots = self.live_snapshots().await;
        let conflicts = self.inner.detector.detect(&snapshots);
        if conflicts.is_empty() {
            return Vec::new();
        }
        let outcomes = self
            .inner
            .resolver
            .resolve(conflicts, self.inner.services.clock.now());

        let mut pass = Pass::new();
        for outcome in &outcomes {
            let conflict = outcome.conflict();
            match outcome {
                ConflictOutcome::Escalated { reason, .. } => tracing::warn!(
                    conflict_id = %conflict.id,
                    subject = %conflict.subject,
                    severity = conflict.severity,
                    reason = %reason,
                    "Conflict escalated for manual resolution"
                ),
                ConflictOutcome::Resolved { .. } => tracing::info!(
                    conflict_id = %conflict.id,
                    subject = %conflict.subject,
                    strategy = ?conflict.strategy,
                    "Conflict resolved"
                ),
                ConflictOutcome::Skipped { .. } => tracing::debug!(
                    conflict_id = %conflict.id,
                    subject = %conflict.subject,
                    "Conflict left as is"
                ),
            }
            for action in outcome.actions() {
                self.apply_follow_up(&action.workflow_id, action.command.clone(), None, &mut pass)
                    .await;
            }
        }
        self.run(&mut pass).await;
        outcomes
    }

    // --- Consistency -----------------------------------------------------

    /// Reconciles the workflow with the cloud copy now, whatever the level.
    pub async fn reconcile(&self, workflow_id: &WorkflowId) -> Result<Reconciled, Rejected> {
        self.ensure_running()?;
        let Some(manager) = self.inner.consistency.clone() else {
            let error = WorkflowError::validation("no edge/cloud transport configured");
            return Err(self.rejected(error, workflow_id));
        };
        let snapshot = self.snapshot(workflow_id).await?;

        let mut pass = Pass::new();
        pass.mark_synced(workflow_id);
        match manager.reconcile(ReplicaState::from_snapshot(&snapshot)).await {
            Ok(reconciled) => {
                self.adopt(reconciled.clone(), &mut pass).await;
                self.run(&mut pass).await;
                Ok(reconciled)
            }
            Err(error) => {
                pass.push(Work::Recover(FailureSignal::new(
                    workflow_id.clone(),
                    FailureKind::Transport,
                    error.to_string(),
                )));
                self.run(&mut pass).await;
                Err(self.rejected(error, workflow_id))
            }
        }
    }

    pub(crate) async fn on_consistency_event(&self, event: ConsistencyEvent) {
        let mut pass = Pass::new();
        match event {
            ConsistencyEvent::Reconciled(reconciled) => {
                pass.mark_synced(&reconciled.workflow_id);
                self.adopt(reconciled, &mut pass).await;
            }
            ConsistencyEvent::Failed { workflow_id, error } => {
                pass.mark_synced(&workflow_id);
                let settled = self
                    .current(&workflow_id)
                    .await
                    .map_or(true, |snapshot| snapshot.status().is_terminal());
                if !settled {
                    pass.push(Work::Recover(FailureSignal::new(
                        workflow_id,
                        FailureKind::Transport,
                        error.to_string(),
                    )));
                }
            }
        }
        self.run(&mut pass).await;
    }

    // --- Dependencies ----------------------------------------------------

    pub fn add_dependency(&self, dependency: WorkflowDependency) -> Result<(), WorkflowError> {
        self.inner.graph.add_dependency(dependency)
    }

    pub fn remove_dependency(&self, source: &WorkflowId, target: &WorkflowId) -> bool {
        self.inner.graph.remove_dependency(source, target)
    }

    // --- Reads -----------------------------------------------------------

    pub async fn snapshot(&self, workflow_id: &WorkflowId) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        match self.inner.cache.get(workflow_id).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(WorkflowError::NotFound(workflow_id.clone()).into()),
            Err(error) => Err(error.into()),
        }
    }

    /// The workflow's full event log.
    pub async fn events(&self, workflow_id: &WorkflowId) -> Result<Vec<RecordedEvent>, WorkflowError> {
        self.inner.store.read(workflow_id, 1).await
    }

    /// Evaluates the workflow's incoming dependency edges now.
    pub async fn resolve_dependencies(&self, workflow_id: &WorkflowId) -> DependencyResolution {
        let mut snapshots = std::collections::HashMap::new();
        for dependency in self.inner.graph.dependencies(workflow_id) {
            if let Some(snapshot) = self.current(&dependency.source).await {
                snapshots.insert(dependency.source.clone(), snapshot);
            }
        }
        let context = orchestration::EngineDependencyContext {
            snapshots,
            resources: self.inner.resources.as_ref(),
        };
        self.inner.graph.resolve(workflow_id, &context)
    }

    // --- Command path ----------------------------------------------------

    /// Sends one command through the workflow's actor, then runs every
    /// follow-up it causes.
    pub async fn submit(&self, workflow_id: &WorkflowId, command: WorkflowCommand) -> Result<Committed, Rejected> {
        self.ensure_running()?;
        let mut pass = Pass::new();
        let committed = self.apply(workflow_id, command, None, &mut pass).await?;
        self.run(&mut pass).await;
        Ok(committed)
    }

    async fn execute(&self, workflow_id: &WorkflowId, command: WorkflowCommand) -> Result<Arc<WorkflowSnapshot>, Rejected> {
        let committed = self.submit(workflow_id, command).await?;
        Ok(self.current(workflow_id).await.unwrap_or(committed.snapshot))
    }

    async fn send_command(
        &self,
        workflow_id: &WorkflowId,
        command: WorkflowCommand,
        metadata: EventMetadata,
    ) -> CommandOutcome {
        let actor = match self.actor_for(workflow_id).await {
            Ok(actor) => actor,
            Err(error) => return Err(self.rejected(error, workflow_id)),
        };

        let (tx, rx) = oneshot::channel();
        let envelope = CommandEnvelope::new(command).with_metadata(metadata);
        if actor
            .send_message(WorkflowMessage::Command(Box::new(envelope), tx))
            .is_err()
        {
            return Err(self.rejected(actor_unavailable(workflow_id), workflow_id));
        }
        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => return Err(self.rejected(actor_unavailable(workflow_id), workflow_id)),
        };

        if let Ok(committed) = &outcome {
            for record in &committed.events {
                self.inner.handlers.dispatch(record, &committed.snapshot);
            }
        }
        outcome
    }

    async fn actor_for(&self, workflow_id: &WorkflowId) -> Result<ActorRef<WorkflowMessage>, WorkflowError> {
        let args = WorkflowActorArgs {
            workflow_id: workflow_id.clone(),
            store: self.inner.store.clone(),
            cache: self.inner.cache.clone(),
            event_tx: self.inner.event_tx.clone(),
            services: self.inner.services.clone(),
        };
        let (tx, rx) = oneshot::channel();
        self.inner
            .supervisor
            .send_message(SupervisorMsg::Spawn(Box::new(args), tx))
            .map_err(|_| supervisor_unavailable())?;
        let actor = rx
            .await
            .map_err(|_| supervisor_unavailable())?
            .map_err(|message| StorageError::Io { message })?;
        self.inner.live.insert(workflow_id.clone());
        Ok(actor)
    }

    /// Snapshots of every active or paused workflow.
    async fn live_snapshots(&self) -> Vec<Arc<WorkflowSnapshot>> {
        let mut snapshots = Vec::new();
        for status in [WorkflowStatus::Active, WorkflowStatus::Paused] {
            for workflow_id in self.inner.cache.workflows_with_status(status) {
                if let Some(snapshot) = self.current(&workflow_id).await {
                    snapshots.push(snapshot);
                }
            }
        }
        snapshots
    }

    /// Latest snapshot, `None` when unknown or unreadable.
    async fn current(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowSnapshot>> {
        match self.inner.cache.get(workflow_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(workflow_id = %workflow_id, error = %error, "Snapshot unavailable");
                None
            }
        }
    }

    fn rejected(&self, error: WorkflowError, workflow_id: &WorkflowId) -> Rejected {
        Rejected::new(error, self.inner.cache.peek(workflow_id))
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), Rejected> {
        if self.is_stopped() {
            return Err(WorkflowError::validation("workflow engine has been shut down").into());
        }
        Ok(())
    }
}

fn actor_unavailable(workflow_id: &WorkflowId) -> WorkflowError {
    StorageError::Io {
        message: format!("workflow actor for {workflow_id} is unavailable"),
    }
    .into()
}

fn supervisor_unavailable() -> WorkflowError {
    StorageError::Io {
        message: "workflow supervisor is unavailable".to_string(),
    }
    .into()
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
