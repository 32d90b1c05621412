//! Conflict detection and resolution across active workflows.
//!
//! Detection runs composable [`ConflictRule`]s over copies of the active
//! snapshots. Resolution handles conflicts highest-severity-first and only
//! ever plans compensating commands; snapshots change when the engine
//! submits those commands to the affected workflows.

mod rules;
mod strategies;

pub use rules::{
    default_rules, ConflictRule, DataConsistencyRule, Finding, ResourceContentionRule,
    SafetyZoneRule, TemporalOverlapRule,
};
pub use strategies::{
    planner_for, Negotiation, PlanContext, PriorityPreemption, ResolutionPlanner,
    ResourceReallocation, TemporalReschedule,
};

use crate::config::ConflictConfig;
use crate::domain::cqrs::WorkflowCommand;
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::{
    AgentId, StepConstraints, StepId, StepStatus, TimeWindow, TimestampUtc, WorkflowId,
    WorkflowStatus, WorkflowStepDefinition,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ResourceContention,
    TemporalOverlap,
    DataConsistency,
    SafetyZone,
}

impl ConflictType {
    pub const ALL: [ConflictType; 4] = [
        ConflictType::ResourceContention,
        ConflictType::TemporalOverlap,
        ConflictType::DataConsistency,
        ConflictType::SafetyZone,
    ];

    pub fn default_strategy(&self) -> ResolutionStrategy {
        match self {
            ConflictType::ResourceContention => ResolutionStrategy::ResourceReallocation,
            ConflictType::TemporalOverlap => ResolutionStrategy::TemporalReschedule,
            ConflictType::DataConsistency => ResolutionStrategy::Negotiation,
            ConflictType::SafetyZone => ResolutionStrategy::PriorityPreemption,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictType::ResourceContention => "resource_contention",
            ConflictType::TemporalOverlap => "temporal_overlap",
            ConflictType::DataConsistency => "data_consistency",
            ConflictType::SafetyZone => "safety_zone",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    PriorityPreemption,
    Negotiation,
    ResourceReallocation,
    TemporalReschedule,
}

/// One step implicated in a conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictParty {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub agent_id: Option<AgentId>,
    pub priority: u8,
    pub started_at: Option<TimestampUtc>,
    pub window: Option<TimeWindow>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowConflict {
    pub id: Uuid,
    pub conflict_type: ConflictType,
    /// 1 (cosmetic) to 10 (stop everything).
    pub severity: u8,
    pub subject: String,
    pub parties: Vec<ConflictParty>,
    pub description: String,
    pub strategy: ResolutionStrategy,
    pub detected_at: TimestampUtc,
}

impl WorkflowConflict {
    pub fn workflow_ids(&self) -> BTreeSet<WorkflowId> {
        self.parties
            .iter()
            .map(|party| party.workflow_id.clone())
            .collect()
    }
}

/// A compensating command for one workflow.
#[derive(Debug, Clone)]
pub struct ConflictAction {
    pub workflow_id: WorkflowId,
    pub step_id: Option<StepId>,
    pub command: WorkflowCommand,
}

#[derive(Debug, Clone)]
pub enum ConflictOutcome {
    Resolved {
        conflict: WorkflowConflict,
        actions: Vec<ConflictAction>,
    },
    /// Parked for manual resolution; `actions` escalate every implicated workflow.
    Escalated {
        conflict: WorkflowConflict,
        reason: String,
        actions: Vec<ConflictAction>,
    },
    /// A party was already compensated earlier in the same pass.
    Skipped { conflict: WorkflowConflict },
}

impl ConflictOutcome {
    pub fn conflict(&self) -> &WorkflowConflict {
        match self {
            ConflictOutcome::Resolved { conflict, .. }
            | ConflictOutcome::Escalated { conflict, .. }
            | ConflictOutcome::Skipped { conflict } => conflict,
        }
    }

    pub fn actions(&self) -> &[ConflictAction] {
        match self {
            ConflictOutcome::Resolved { actions, .. }
            | ConflictOutcome::Escalated { actions, .. } => actions,
            ConflictOutcome::Skipped { .. } => &[],
        }
    }
}

/// What an in-flight (or reserved) step holds.
#[derive(Debug, Clone)]
pub struct StepClaim {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    /// Assigned agent, else the agent pinned by the definition.
    pub agent_id: Option<AgentId>,
    pub priority: u8,
    pub constraints: StepConstraints,
    pub started_at: Option<TimestampUtc>,
    pub running: bool,
}

impl StepClaim {
    /// Running steps, plus pending steps holding a window reservation, of
    /// every ACTIVE snapshot.
    pub fn collect(snapshots: &[Arc<WorkflowSnapshot>]) -> Vec<StepClaim> {
        let mut claims = Vec::new();
        for snapshot in snapshots {
            if snapshot.status() != WorkflowStatus::Active {
                continue;
            }
            for definition in &snapshot.definition.steps {
                let Some(state) = snapshot.step(&definition.id) else {
                    continue;
                };
                let running = state.status == StepStatus::Running;
                let reserved =
                    state.status == StepStatus::Pending && definition.constraints.window.is_some();
                if !running && !reserved {
                    continue;
                }
                claims.push(StepClaim {
                    workflow_id: snapshot.workflow_id.clone(),
                    step_id: definition.id.clone(),
                    agent_id: snapshot
                        .assigned_agents
                        .get(&definition.id)
                        .or(definition.agent.as_ref())
                        .cloned(),
                    priority: snapshot.definition.priority,
                    constraints: definition.constraints.clone(),
                    started_at: state.started_at,
                    running,
                });
            }
        }
        claims
    }

    /// The claim `definition` would hold if it started now on `agent_id`.
    pub fn prospective(
        snapshot: &WorkflowSnapshot,
        definition: &WorkflowStepDefinition,
        agent_id: &AgentId,
    ) -> StepClaim {
        StepClaim {
            workflow_id: snapshot.workflow_id.clone(),
            step_id: definition.id.clone(),
            agent_id: Some(agent_id.clone()),
            priority: snapshot.definition.priority,
            constraints: definition.constraints.clone(),
            started_at: None,
            running: true,
        }
    }

    pub fn party(&self) -> ConflictParty {
        ConflictParty {
            workflow_id: self.workflow_id.clone(),
            step_id: self.step_id.clone(),
            agent_id: self.agent_id.clone(),
            priority: self.priority,
            started_at: self.started_at,
            window: self.constraints.window,
            running: self.running,
        }
    }

    /// First agent or resource both claims hold.
    pub fn shared_holding(&self, other: &StepClaim) -> Option<String> {
        if let (Some(a), Some(b)) = (&self.agent_id, &other.agent_id) {
            if a == b {
                return Some(format!("agent:{a}"));
            }
        }
        self.constraints
            .resources
            .iter()
            .find(|resource| other.constraints.resources.contains(resource))
            .map(|resource| format!("resource:{resource}"))
    }
}

/// Runs every registered rule over the active snapshots.
pub struct ConflictDetector {
    rules: Vec<Box<dyn ConflictRule>>,
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            rules: default_rules(),
            config,
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn ConflictRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn detect(&self, snapshots: &[Arc<WorkflowSnapshot>]) -> Vec<WorkflowConflict> {
        let claims = StepClaim::collect(snapshots);
        if claims.len() < 2 {
            return Vec::new();
        }
        let detected_at = TimestampUtc::now();
        let mut conflicts = Vec::new();
        for rule in &self.rules {
            let conflict_type = rule.conflict_type();
            for finding in rule.detect(&claims) {
                conflicts.push(WorkflowConflict {
                    id: Uuid::new_v4(),
                    conflict_type,
                    severity: self.config.severities.for_type(conflict_type),
                    subject: finding.subject,
                    parties: finding.parties,
                    description: finding.description,
                    strategy: self.config.strategy_for(conflict_type),
                    detected_at,
                });
            }
        }
        conflicts
    }

    /// Whether `claim` would be a party to any conflict among the claims
    /// of `snapshots`. The claimed step's own current claim is ignored.
    pub fn would_conflict(&self, claim: &StepClaim, snapshots: &[Arc<WorkflowSnapshot>]) -> bool {
        let mut claims: Vec<StepClaim> = StepClaim::collect(snapshots)
            .into_iter()
            .filter(|other| other.workflow_id != claim.workflow_id || other.step_id != claim.step_id)
            .collect();
        claims.push(claim.clone());
        self.rules.iter().any(|rule| {
            rule.detect(&claims).iter().any(|finding| {
                finding
                    .parties
                    .iter()
                    .any(|party| party.workflow_id == claim.workflow_id && party.step_id == claim.step_id)
            })
        })
    }
}

/// Turns conflicts into compensating actions or escalations.
pub struct ConflictResolver {
    planners: HashMap<ResolutionStrategy, Box<dyn ResolutionPlanner>>,
    escalation_severity: u8,
    reschedule_delay_ms: u64,
}

impl ConflictResolver {
    pub fn new(config: &ConflictConfig) -> Self {
        let planners = [
            ResolutionStrategy::PriorityPreemption,
            ResolutionStrategy::Negotiation,
            ResolutionStrategy::ResourceReallocation,
            ResolutionStrategy::TemporalReschedule,
        ]
        .into_iter()
        .map(|strategy| (strategy, planner_for(strategy)))
        .collect();
        Self {
            planners,
            escalation_severity: config.escalation_severity,
            reschedule_delay_ms: config.reschedule_delay_ms,
        }
    }

    /// Replaces the planner used for `strategy`.
    pub fn with_planner(
        mut self,
        strategy: ResolutionStrategy,
        planner: Box<dyn ResolutionPlanner>,
    ) -> Self {
        self.planners.insert(strategy, planner);
        self
    }

    /// Resolves `conflicts` highest-severity-first.
    pub fn resolve(
        &self,
        mut conflicts: Vec<WorkflowConflict>,
        now: TimestampUtc,
    ) -> Vec<ConflictOutcome> {
        conflicts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.conflict_type.cmp(&b.conflict_type))
                .then_with(|| a.subject.cmp(&b.subject))
        });

        let context = PlanContext {
            now,
            reschedule_delay_ms: self.reschedule_delay_ms,
        };
        let mut compensated: HashSet<(WorkflowId, StepId)> = HashSet::new();
        let mut parked: HashSet<WorkflowId> = HashSet::new();
        let mut outcomes = Vec::with_capacity(conflicts.len());

        for conflict in conflicts {
            let touched = conflict.parties.iter().any(|party| {
                parked.contains(&party.workflow_id)
                    || compensated.contains(&(party.workflow_id.clone(), party.step_id.clone()))
            });
            if touched {
                tracing::debug!(conflict_id = %conflict.id, subject = %conflict.subject, "Conflict already compensated in this pass");
                outcomes.push(ConflictOutcome::Skipped { conflict });
                continue;
            }

            let plan = if conflict.severity >= self.escalation_severity {
                Err(format!(
                    "severity {} reaches escalation threshold {}",
                    conflict.severity, self.escalation_severity
                ))
            } else {
                self.planners
                    .get(&conflict.strategy)
                    .and_then(|planner| planner.plan(&conflict, &context))
                    .ok_or_else(|| format!("{:?} could not resolve the conflict", conflict.strategy))
            };

            match plan {
                Ok(actions) => {
                    for action in &actions {
                        if let Some(step_id) = &action.step_id {
                            compensated.insert((action.workflow_id.clone(), step_id.clone()));
                        }
                    }
                    tracing::info!(
                        conflict_id = %conflict.id,
                        conflict_type = %conflict.conflict_type,
                        severity = conflict.severity,
                        actions = actions.len(),
                        "Conflict resolved"
                    );
                    outcomes.push(ConflictOutcome::Resolved { conflict, actions });
                }
                Err(reason) => {
                    let actions: Vec<ConflictAction> = conflict
                        .workflow_ids()
                        .into_iter()
                        .map(|workflow_id| {
                            parked.insert(workflow_id.clone());
                            ConflictAction {
                                workflow_id,
                                step_id: None,
                                command: WorkflowCommand::EscalateConflict {
                                    conflict_id: conflict.id,
                                    severity: conflict.severity,
                                    description: conflict.description.clone(),
                                },
                            }
                        })
                        .collect();
                    tracing::warn!(
                        conflict_id = %conflict.id,
                        conflict_type = %conflict.conflict_type,
                        severity = conflict.severity,
                        reason = %reason,
                        "Conflict escalated for manual resolution"
                    );
                    outcomes.push(ConflictOutcome::Escalated {
                        conflict,
                        reason,
                        actions,
                    });
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
#[path = "tests/conflict_tests.rs"]
mod tests;
