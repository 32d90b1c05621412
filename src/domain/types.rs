//! Core identifiers and value types shared across the engine.

use crate::domain::condition::Condition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a workflow. Also the event stream / aggregate id.
    WorkflowId
);
string_id!(
    /// Identifier of a step, unique within its workflow definition.
    StepId
);
string_id!(
    /// Identifier of an execution agent (robot, operator, AI system).
    AgentId
);

impl WorkflowId {
    /// Generates a fresh random workflow id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// UTC timestamp wrapper with RFC 3339 serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampUtc(pub DateTime<Utc>);

impl TimestampUtc {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Returns this timestamp shifted forward by `millis`.
    pub fn plus_millis(&self, millis: u64) -> Self {
        let delta = chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX));
        Self(self.0.checked_add_signed(delta).unwrap_or(self.0))
    }

    /// Milliseconds elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn millis_since(&self, earlier: &TimestampUtc) -> u64 {
        let delta = self.0.signed_duration_since(earlier.0).num_milliseconds();
        u64::try_from(delta).unwrap_or(0)
    }
}

impl Default for TimestampUtc {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for TimestampUtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// Top-level workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Completed and cancelled workflows never leave their state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Cancelled)
    }

    /// Terminal, or failed (only an explicit retry leaves `Failed`).
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Active => "ACTIVE",
            WorkflowStatus::Paused => "PAUSED",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Substates of `ACTIVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActiveSubstate {
    Initializing,
    Executing,
    Waiting,
    Synchronizing,
    Finalizing,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed or skipped: downstream steps may proceed.
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// The kind of a step and its type-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    /// Runs after the previous step in definition order.
    Sequential,
    /// Runs as soon as its declared dependencies are done.
    Parallel,
    /// Runs only if the condition holds on the global context, otherwise skipped.
    Conditional { condition: Condition },
    /// Re-dispatched until `max_iterations` or until `until` holds.
    Loop {
        max_iterations: u32,
        #[serde(default)]
        until: Option<Condition>,
    },
    /// A barrier that completes once `required_agents` agents arrive.
    Synchronization { required_agents: usize },
}

/// Reserved time window for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: TimestampUtc,
    pub end: TimestampUtc,
}

impl TimeWindow {
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Resource claims a step makes while it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConstraints {
    #[serde(default)]
    pub resources: Vec<String>,
    /// Exclusive safety zone occupied while running.
    #[serde(default)]
    pub zone: Option<String>,
    /// Data keys written by the step.
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub window: Option<TimeWindow>,
}

/// Step template inside a [`WorkflowDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepDefinition {
    pub id: StepId,
    #[serde(flatten)]
    pub step_type: StepType,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Pre-assigned agent; bypasses the agent selector.
    #[serde(default)]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub constraints: StepConstraints,
}

impl WorkflowStepDefinition {
    pub fn sequential(id: impl Into<StepId>) -> Self {
        Self::new(id, StepType::Sequential)
    }

    pub fn new(id: impl Into<StepId>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            step_type,
            parameters: Map::new(),
            depends_on: Vec::new(),
            agent: None,
            constraints: StepConstraints::default(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<AgentId>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_constraints(mut self, constraints: StepConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn depending_on(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.push(step.into());
        self
    }
}

/// Retry policy carried by a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_backoff_ms as f64 * self.backoff_coefficient.powi(exponent);
        if !raw.is_finite() || raw >= self.max_backoff_ms as f64 {
            return self.max_backoff_ms;
        }
        raw.max(0.0) as u64
    }
}

/// Immutable workflow template supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<WorkflowStepDefinition>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Higher wins preemption.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub candidate_agents: Vec<AgentId>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<WorkflowId>, steps: Vec<WorkflowStepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            steps,
            parameters: Map::new(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            priority: 0,
            candidate_agents: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_candidates(mut self, agents: Vec<AgentId>) -> Self {
        self.candidate_agents = agents;
        self
    }

    pub fn step(&self, id: &StepId) -> Option<&WorkflowStepDefinition> {
        self.steps.iter().find(|step| &step.id == id)
    }

    /// Steps that must be done before `id` may start.
    ///
    /// Sequential steps without declared dependencies implicitly follow the
    /// previous step in definition order.
    pub fn effective_dependencies(&self, id: &StepId) -> Vec<StepId> {
        let Some(index) = self.steps.iter().position(|step| &step.id == id) else {
            return Vec::new();
        };
        let step = &self.steps[index];
        if !step.depends_on.is_empty() {
            return step.depends_on.clone();
        }
        match (&step.step_type, index.checked_sub(1)) {
            (StepType::Sequential, Some(previous)) => vec![self.steps[previous].id.clone()],
            _ => Vec::new(),
        }
    }
}
