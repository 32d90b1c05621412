//! Failure taxonomy and recovery strategy types.
//!
//! Failure signals are raised by execution callbacks, watchdogs, the
//! conflict resolver and the consistency manager, then handed to the
//! recovery manager.

use crate::domain::types::{StepId, TimestampUtc, WorkflowId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Canonical failure types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The execution agent reported an error or went silent.
    AgentFailure,
    /// A step or workflow exceeded its timeout.
    Timeout,
    /// Network-level error reported by an adapter.
    Network,
    /// A synchronization point stayed closed past the stall timeout.
    CoordinationTimeout,
    /// Checkpoint digest mismatch or unreadable state.
    DataCorruption,
    /// A safety constraint was violated.
    SafetyViolation,
    /// A conflict could not be resolved automatically.
    ConflictUnresolved,
    /// Storage backend failure affecting an active workflow.
    Storage,
    /// Edge/cloud transport failure.
    Transport,
    /// Unclassified failure.
    Unknown,
}

impl FailureKind {
    /// Every kind, in declaration order.
    pub const ALL: [FailureKind; 10] = [
        FailureKind::AgentFailure,
        FailureKind::Timeout,
        FailureKind::Network,
        FailureKind::CoordinationTimeout,
        FailureKind::DataCorruption,
        FailureKind::SafetyViolation,
        FailureKind::ConflictUnresolved,
        FailureKind::Storage,
        FailureKind::Transport,
        FailureKind::Unknown,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            FailureKind::AgentFailure => "Agent Failure",
            FailureKind::Timeout => "Timeout",
            FailureKind::Network => "Network",
            FailureKind::CoordinationTimeout => "Coordination Timeout",
            FailureKind::DataCorruption => "Data Corruption",
            FailureKind::SafetyViolation => "Safety Violation",
            FailureKind::ConflictUnresolved => "Conflict Unresolved",
            FailureKind::Storage => "Storage",
            FailureKind::Transport => "Transport",
            FailureKind::Unknown => "Unknown",
        }
    }

    /// Classifies free-text failure details reported by an adapter.
    pub fn classify(details: &str) -> FailureKind {
        for (pattern, kind) in classifiers() {
            if pattern.is_match(details) {
                return kind.clone();
            }
        }
        FailureKind::AgentFailure
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Regex patterns for classifying network errors.
pub const NETWORK_ERROR_PATTERN: &str =
    r"(?i)connect|network|ECONNREFUSED|ETIMEDOUT|connection\s+refused|name\s+resolution|DNS|socket";

/// Regex patterns for classifying timeouts.
pub const TIMEOUT_PATTERN: &str = r"(?i)timed?\s*out|deadline\s+exceeded|no\s+heartbeat";

/// Regex patterns for classifying corrupted data.
pub const CORRUPTION_PATTERN: &str = r"(?i)corrupt|checksum|digest\s+mismatch|malformed";

/// Regex patterns for classifying safety violations.
pub const SAFETY_PATTERN: &str = r"(?i)e-?stop|emergency\s+stop|collision|safety|zone\s+breach";

fn classifiers() -> &'static [(Regex, FailureKind)] {
    static CLASSIFIERS: OnceLock<Vec<(Regex, FailureKind)>> = OnceLock::new();
    CLASSIFIERS.get_or_init(|| {
        // Safety first: a collision report that mentions a timeout is still a safety event.
        [
            (SAFETY_PATTERN, FailureKind::SafetyViolation),
            (CORRUPTION_PATTERN, FailureKind::DataCorruption),
            (TIMEOUT_PATTERN, FailureKind::Timeout),
            (NETWORK_ERROR_PATTERN, FailureKind::Network),
        ]
        .into_iter()
        .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
        .collect()
    })
}

/// A failure report routed to the recovery manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub kind: FailureKind,
    pub details: String,
    /// Explicit severity, overriding the configured table.
    #[serde(default)]
    pub severity: Option<u8>,
    pub raised_at: TimestampUtc,
}

impl FailureSignal {
    pub fn new(workflow_id: WorkflowId, kind: FailureKind, details: impl Into<String>) -> Self {
        Self {
            workflow_id,
            step_id: None,
            kind,
            details: details.into(),
            severity: None,
            raised_at: TimestampUtc::now(),
        }
    }

    /// Builds a signal for a failed step, classifying the error text.
    pub fn from_step_error(workflow_id: WorkflowId, step_id: StepId, error: &str) -> Self {
        Self {
            workflow_id,
            step_id: Some(step_id),
            kind: FailureKind::classify(error),
            details: error.to_string(),
            severity: None,
            raised_at: TimestampUtc::now(),
        }
    }

    pub fn for_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Strategy chosen by the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    CheckpointRestore,
    PartialRollback,
    ManualIntervention,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::CheckpointRestore => "checkpoint_restore",
            RecoveryStrategy::PartialRollback => "partial_rollback",
            RecoveryStrategy::ManualIntervention => "manual_intervention",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_details() {
        assert_eq!(
            FailureKind::classify("ECONNREFUSED while contacting arm-3"),
            FailureKind::Network
        );
        assert_eq!(
            FailureKind::classify("gripper timed out after 30s"),
            FailureKind::Timeout
        );
        assert_eq!(
            FailureKind::classify("checksum failed on trajectory file"),
            FailureKind::DataCorruption
        );
        assert_eq!(
            FailureKind::classify("collision detected, timed out waiting for reset"),
            FailureKind::SafetyViolation
        );
        assert_eq!(
            FailureKind::classify("operator declined task"),
            FailureKind::AgentFailure
        );
    }

    #[test]
    fn test_signal_serde() {
        let signal = FailureSignal::new(WorkflowId::from("w1"), FailureKind::Network, "down")
            .with_severity(2);
        let json = serde_json::to_string(&signal).expect("serialize");
        let parsed: FailureSignal = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, signal);
    }
}
