//! Failure-driven recovery.
//!
//! The manager turns a [`FailureSignal`] into a [`RecoveryPlan`]: an ordered
//! list of commands for the failed workflow. It never touches state itself;
//! the engine submits the plan through the workflow's actor, so every
//! recovery action is an audited event.
//!
//! Strategy selection:
//!
//! | Severity              | Strategy                          |
//! |-----------------------|-----------------------------------|
//! | `..= retry_max`       | bounded retry with backoff        |
//! | `..= restore_max`     | checkpoint restore (if simple)    |
//! | `..= rollback_max`    | partial rollback of the failed branch |
//! | above                 | manual intervention (parked)      |

pub mod checkpoint;

pub use checkpoint::{is_checkpoint_stream, CheckpointStore, RecoveryCheckpoint};

use crate::config::RecoveryConfig;
use crate::domain::cqrs::WorkflowCommand;
use crate::domain::errors::WorkflowError;
use crate::domain::failure::{FailureKind, FailureSignal, RecoveryStrategy};
use crate::domain::snapshot::{ExecutionState, StepState, WorkflowSnapshot};
use crate::domain::types::{StepId, StepStatus, WorkflowStatus};
use crate::event_store::StorageBackend;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Commands recovering one workflow from one failure.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub failure: FailureSignal,
    pub severity: u8,
    /// Strategy the severity maps to.
    pub band: RecoveryStrategy,
    /// Strategy actually applied after degradation rules.
    pub strategy: RecoveryStrategy,
    pub checkpoint_id: Option<Uuid>,
    pub complexity: Option<usize>,
    pub commands: Vec<WorkflowCommand>,
    pub note: String,
}

impl RecoveryPlan {
    /// Only the audit record, no corrective action.
    pub fn is_audit_only(&self) -> bool {
        self.commands.len() <= 1
    }
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    checkpoints: CheckpointStore,
}

/// Why the latest checkpoint cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
enum Unusable {
    #[error("no checkpoint")]
    Missing,
    #[error("checkpoint {0} is corrupt")]
    Corrupt(Uuid),
    #[error("checkpoint {0} was taken in a settled state")]
    Settled(Uuid),
}

/// Intermediate decision before the audit command is prepended.
struct Decision {
    strategy: RecoveryStrategy,
    checkpoint_id: Option<Uuid>,
    complexity: Option<usize>,
    commands: Vec<WorkflowCommand>,
    note: String,
}

impl Decision {
    fn new(strategy: RecoveryStrategy, commands: Vec<WorkflowCommand>, note: impl Into<String>) -> Self {
        Self {
            strategy,
            checkpoint_id: None,
            complexity: None,
            commands,
            note: note.into(),
        }
    }
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let checkpoints = CheckpointStore::new(backend, config.checkpoints_kept);
        Self {
            config,
            checkpoints,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Severity of a signal: explicit override, else the configured table.
    pub fn severity(&self, failure: &FailureSignal) -> u8 {
        failure
            .severity
            .unwrap_or_else(|| self.config.severity_of(&failure.kind))
            .clamp(1, 10)
    }

    /// Captures and persists a checkpoint of `snapshot`.
    pub async fn checkpoint(
        &self,
        snapshot: &WorkflowSnapshot,
        label: &str,
    ) -> Result<RecoveryCheckpoint, WorkflowError> {
        let agent_states = snapshot
            .assigned_agents
            .iter()
            .map(|(step_id, agent_id)| {
                (
                    agent_id.clone(),
                    serde_json::json!({
                        "step": step_id.as_str(),
                        "step_status": snapshot.step_status(step_id),
                    }),
                )
            })
            .collect::<BTreeMap<_, Value>>();
        let checkpoint = RecoveryCheckpoint::capture(snapshot, label, agent_states);
        self.checkpoints.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Plans the recovery of `snapshot` from `failure`.
    pub async fn plan(
        &self,
        snapshot: &WorkflowSnapshot,
        failure: FailureSignal,
    ) -> Result<RecoveryPlan, WorkflowError> {
        let severity = self.severity(&failure);
        let band = self.config.thresholds.band(severity);

        let decision = match snapshot.status() {
            WorkflowStatus::Completed | WorkflowStatus::Cancelled => {
                return Err(WorkflowError::InvalidTransition {
                    state: snapshot.phase.to_string(),
                    trigger: "initiate_recovery".to_string(),
                });
            }
            WorkflowStatus::Failed => self.retry_failed_workflow(snapshot),
            WorkflowStatus::Pending => {
                Decision::new(band, Vec::new(), "workflow not started, nothing to recover")
            }
            WorkflowStatus::Paused if snapshot.phase.is_parked() => Decision::new(
                RecoveryStrategy::ManualIntervention,
                Vec::new(),
                "already awaiting manual resolution",
            ),
            WorkflowStatus::Active | WorkflowStatus::Paused => match band {
                RecoveryStrategy::Retry => self.retry(snapshot, &failure),
                RecoveryStrategy::CheckpointRestore => self.restore(snapshot, &failure).await?,
                RecoveryStrategy::PartialRollback => self.rollback(snapshot, &failure).await?,
                RecoveryStrategy::ManualIntervention => escalate(&failure, "severity above automatic recovery"),
            },
        };

        let mut commands = Vec::with_capacity(decision.commands.len() + 1);
        commands.push(WorkflowCommand::InitiateRecovery {
            failure: failure.clone(),
            severity,
            strategy: decision.strategy,
        });
        commands.extend(decision.commands);

        tracing::info!(
            workflow_id = %failure.workflow_id,
            kind = %failure.kind,
            severity,
            band = %band,
            strategy = %decision.strategy,
            note = %decision.note,
            "Recovery planned"
        );

        Ok(RecoveryPlan {
            failure,
            severity,
            band,
            strategy: decision.strategy,
            checkpoint_id: decision.checkpoint_id,
            complexity: decision.complexity,
            commands,
            note: decision.note,
        })
    }

    fn retry_failed_workflow(&self, snapshot: &WorkflowSnapshot) -> Decision {
        let budget = snapshot.definition.retry_policy.max_retries;
        if snapshot.attempt < budget {
            Decision::new(
                RecoveryStrategy::Retry,
                vec![WorkflowCommand::RetryWorkflow],
                format!("workflow retry {} of {budget}", snapshot.attempt + 1),
            )
        } else {
            Decision::new(
                RecoveryStrategy::Retry,
                Vec::new(),
                format!("workflow retry budget of {budget} exhausted"),
            )
        }
    }

    /// Step retry with backoff, or failing the workflow once the budget is spent.
    fn retry(&self, snapshot: &WorkflowSnapshot, failure: &FailureSignal) -> Decision {
        match self.step_retry(snapshot, failure) {
            Some(commands) => Decision::new(RecoveryStrategy::Retry, commands, "step retried"),
            None if failure.step_id.is_none() => Decision::new(
                RecoveryStrategy::Retry,
                Vec::new(),
                "no step to retry, ready steps are re-driven",
            ),
            None => Decision::new(
                RecoveryStrategy::Retry,
                vec![WorkflowCommand::Fail {
                    reason: format!("retries exhausted: {}", failure.details),
                }],
                "retries exhausted",
            ),
        }
    }

    /// Commands retrying the failed step, if it has budget left.
    fn step_retry(
        &self,
        snapshot: &WorkflowSnapshot,
        failure: &FailureSignal,
    ) -> Option<Vec<WorkflowCommand>> {
        let step_id = failure.step_id.as_ref()?;
        let step = snapshot.step(step_id)?;
        let policy = &snapshot.definition.retry_policy;
        if step.attempts >= policy.max_retries {
            return None;
        }

        let mut commands = Vec::new();
        match step.status {
            StepStatus::Failed => {}
            StepStatus::Running => commands.push(WorkflowCommand::FailStep {
                step_id: step_id.clone(),
                error: failure.details.clone(),
            }),
            _ => return None,
        }
        commands.push(WorkflowCommand::RetryStep {
            step_id: step_id.clone(),
            backoff_ms: policy.backoff_ms(step.attempts + 1),
        });
        Some(commands)
    }

    /// Without a usable checkpoint: retry if budget remains, else escalate.
    fn degrade(&self, snapshot: &WorkflowSnapshot, failure: &FailureSignal, why: &str) -> Decision {
        match self.step_retry(snapshot, failure) {
            Some(commands) => Decision::new(
                RecoveryStrategy::Retry,
                commands,
                format!("{why}, degraded to retry"),
            ),
            None => escalate(failure, &format!("{why} and no retries remain")),
        }
    }

    async fn usable_checkpoint(
        &self,
        snapshot: &WorkflowSnapshot,
    ) -> Result<Result<RecoveryCheckpoint, Unusable>, WorkflowError> {
        let Some(checkpoint) = self.checkpoints.latest(&snapshot.workflow_id).await? else {
            return Ok(Err(Unusable::Missing));
        };
        if let Err(err) = checkpoint.verify() {
            tracing::error!(
                workflow_id = %snapshot.workflow_id,
                checkpoint_id = %checkpoint.id,
                error = %err,
                "Checkpoint failed verification"
            );
            return Ok(Err(Unusable::Corrupt(checkpoint.id)));
        }
        if checkpoint.state.phase.status().is_settled() {
            return Ok(Err(Unusable::Settled(checkpoint.id)));
        }
        Ok(Ok(checkpoint))
    }

    /// Corrupt checkpoints escalate; missing ones degrade to retry.
    fn without_checkpoint(
        &self,
        snapshot: &WorkflowSnapshot,
        failure: &FailureSignal,
        unusable: Unusable,
    ) -> Decision {
        let why = unusable.to_string();
        match unusable {
            Unusable::Corrupt(_) => escalate(&corruption(failure, &why), &why),
            Unusable::Missing | Unusable::Settled(_) => self.degrade(snapshot, failure, &why),
        }
    }

    async fn restore(
        &self,
        snapshot: &WorkflowSnapshot,
        failure: &FailureSignal,
    ) -> Result<Decision, WorkflowError> {
        let checkpoint = match self.usable_checkpoint(snapshot).await? {
            Ok(checkpoint) => checkpoint,
            Err(unusable) => return Ok(self.without_checkpoint(snapshot, failure, unusable)),
        };

        let complexity = estimate_complexity(snapshot, &checkpoint);
        if complexity > self.config.restore_complexity_limit {
            let mut decision = self.rollback_from(snapshot, failure, &checkpoint);
            decision.complexity = Some(complexity);
            decision.note = format!(
                "complexity {complexity} above limit {}, {}",
                self.config.restore_complexity_limit, decision.note
            );
            return Ok(decision);
        }

        Ok(Decision {
            strategy: RecoveryStrategy::CheckpointRestore,
            checkpoint_id: Some(checkpoint.id),
            complexity: Some(complexity),
            commands: vec![WorkflowCommand::RestoreCheckpoint {
                checkpoint_id: checkpoint.id,
                state: restorable(&checkpoint),
            }],
            note: format!("restored checkpoint '{}'", checkpoint.label),
        })
    }

    async fn rollback(
        &self,
        snapshot: &WorkflowSnapshot,
        failure: &FailureSignal,
    ) -> Result<Decision, WorkflowError> {
        match self.usable_checkpoint(snapshot).await? {
            Ok(checkpoint) => {
                let mut decision = self.rollback_from(snapshot, failure, &checkpoint);
                decision.complexity = Some(estimate_complexity(snapshot, &checkpoint));
                Ok(decision)
            }
            Err(unusable) => Ok(self.without_checkpoint(snapshot, failure, unusable)),
        }
    }

    fn rollback_from(
        &self,
        snapshot: &WorkflowSnapshot,
        failure: &FailureSignal,
        checkpoint: &RecoveryCheckpoint,
    ) -> Decision {
        let Some(step_id) = failure.step_id.as_ref().filter(|id| snapshot.steps.contains_key(*id))
        else {
            return Decision {
                strategy: RecoveryStrategy::CheckpointRestore,
                checkpoint_id: Some(checkpoint.id),
                complexity: None,
                commands: vec![WorkflowCommand::RestoreCheckpoint {
                    checkpoint_id: checkpoint.id,
                    state: restorable(checkpoint),
                }],
                note: "no failed step, rolled back the whole workflow".to_string(),
            };
        };

        let branch = dependent_closure(snapshot, step_id);
        let steps: BTreeMap<StepId, StepState> = branch
            .iter()
            .map(|id| {
                let state = checkpoint
                    .state
                    .steps
                    .get(id)
                    .cloned()
                    .map(rewind)
                    .unwrap_or_default();
                (id.clone(), state)
            })
            .collect();

        Decision {
            strategy: RecoveryStrategy::PartialRollback,
            checkpoint_id: Some(checkpoint.id),
            complexity: None,
            note: format!("rolled back {} step(s) from {step_id}", steps.len()),
            commands: vec![WorkflowCommand::ApplyPartialRollback {
                checkpoint_id: checkpoint.id,
                steps,
            }],
        }
    }
}

fn escalate(failure: &FailureSignal, why: &str) -> Decision {
    Decision::new(
        RecoveryStrategy::ManualIntervention,
        vec![WorkflowCommand::EscalateToManual {
            reason: format!("{}: {}", failure.kind.display_name(), failure.details),
        }],
        why.to_string(),
    )
}

fn corruption(failure: &FailureSignal, why: &str) -> FailureSignal {
    FailureSignal {
        kind: FailureKind::DataCorruption,
        details: format!("{why} while recovering from {}", failure.details),
        ..failure.clone()
    }
}

/// Steps whose status differs from the checkpoint, plus running steps.
pub fn estimate_complexity(snapshot: &WorkflowSnapshot, checkpoint: &RecoveryCheckpoint) -> usize {
    let diverged = snapshot
        .steps
        .iter()
        .filter(|(id, state)| {
            checkpoint
                .state
                .steps
                .get(*id)
                .map_or(true, |saved| saved.status != state.status)
        })
        .count();
    let running = snapshot.running_steps().count();
    diverged + running
}

/// `root` plus every step that transitively depends on it.
pub fn dependent_closure(snapshot: &WorkflowSnapshot, root: &StepId) -> BTreeSet<StepId> {
    let definition = &snapshot.definition;
    let mut closure = BTreeSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(current) = queue.pop_front() {
        for step in &definition.steps {
            if closure.contains(&step.id) {
                continue;
            }
            if definition.effective_dependencies(&step.id).contains(&current) {
                closure.insert(step.id.clone());
                queue.push_back(step.id.clone());
            }
        }
    }
    closure
}

/// The checkpointed state with every mid-flight step rewound and its agent
/// released, so the engine dispatches those steps afresh.
fn restorable(checkpoint: &RecoveryCheckpoint) -> ExecutionState {
    let mut state = checkpoint.state.clone();
    for (step_id, step) in state.steps.iter_mut() {
        if step.status == StepStatus::Running {
            *step = rewind(step.clone());
            state.assigned_agents.remove(step_id);
        }
    }
    state
}

/// A step captured mid-flight is rolled back to pending so it is re-driven.
fn rewind(mut state: StepState) -> StepState {
    if state.status == StepStatus::Running {
        state.status = StepStatus::Pending;
        state.started_at = None;
    }
    state
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
