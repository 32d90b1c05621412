//! Hierarchical state machine for workflows and steps.
//!
//! This module is the ONLY place transitions are defined. The aggregate
//! validates commands against these tables and `apply` replays them
//! infallibly, so both paths always agree.

use crate::domain::errors::WorkflowError;
use crate::domain::types::{ActiveSubstate, StepStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full workflow state: top-level status plus its refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    Pending,
    Active {
        substate: ActiveSubstate,
    },
    /// `resume_to` is the substate restored on resume. A parked workflow
    /// waits for manual resolution and ignores plain resume.
    Paused {
        resume_to: ActiveSubstate,
        parked: bool,
    },
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowPhase {
    pub fn status(&self) -> WorkflowStatus {
        match self {
            WorkflowPhase::Pending => WorkflowStatus::Pending,
            WorkflowPhase::Active { .. } => WorkflowStatus::Active,
            WorkflowPhase::Paused { .. } => WorkflowStatus::Paused,
            WorkflowPhase::Completed => WorkflowStatus::Completed,
            WorkflowPhase::Failed => WorkflowStatus::Failed,
            WorkflowPhase::Cancelled => WorkflowStatus::Cancelled,
        }
    }

    pub fn substate(&self) -> Option<ActiveSubstate> {
        match self {
            WorkflowPhase::Active { substate } => Some(*substate),
            _ => None,
        }
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, WorkflowPhase::Paused { parked: true, .. })
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowPhase::Active { substate } => write!(f, "ACTIVE({substate:?})"),
            WorkflowPhase::Paused { parked: true, .. } => f.write_str("PAUSED(parked)"),
            other => write!(f, "{}", other.status()),
        }
    }
}

/// Events driving the workflow-level machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTrigger {
    Activate,
    Execute,
    Wait,
    Synchronize,
    Finalize,
    Complete,
    Pause,
    Resume,
    Escalate,
    ResolveManually,
    Fail,
    Cancel,
    Retry,
}

impl WorkflowTrigger {
    pub const ALL: [WorkflowTrigger; 13] = [
        WorkflowTrigger::Activate,
        WorkflowTrigger::Execute,
        WorkflowTrigger::Wait,
        WorkflowTrigger::Synchronize,
        WorkflowTrigger::Finalize,
        WorkflowTrigger::Complete,
        WorkflowTrigger::Pause,
        WorkflowTrigger::Resume,
        WorkflowTrigger::Escalate,
        WorkflowTrigger::ResolveManually,
        WorkflowTrigger::Fail,
        WorkflowTrigger::Cancel,
        WorkflowTrigger::Retry,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowTrigger::Activate => "activate",
            WorkflowTrigger::Execute => "execute",
            WorkflowTrigger::Wait => "wait",
            WorkflowTrigger::Synchronize => "synchronize",
            WorkflowTrigger::Finalize => "finalize",
            WorkflowTrigger::Complete => "complete",
            WorkflowTrigger::Pause => "pause",
            WorkflowTrigger::Resume => "resume",
            WorkflowTrigger::Escalate => "escalate",
            WorkflowTrigger::ResolveManually => "resolve_manually",
            WorkflowTrigger::Fail => "fail",
            WorkflowTrigger::Cancel => "cancel",
            WorkflowTrigger::Retry => "retry",
        }
    }
}

/// Looks up `(phase, trigger)` in the workflow transition table.
pub fn transition(
    phase: WorkflowPhase,
    trigger: WorkflowTrigger,
) -> Result<WorkflowPhase, WorkflowError> {
    use ActiveSubstate::*;
    use WorkflowPhase as P;
    use WorkflowTrigger as T;

    let next = match (phase, trigger) {
        (P::Pending, T::Activate) => Some(P::Active {
            substate: Initializing,
        }),

        (P::Active { substate }, T::Execute)
            if matches!(substate, Initializing | Waiting | Synchronizing) =>
        {
            Some(P::Active {
                substate: Executing,
            })
        }
        (P::Active { substate }, T::Wait) if matches!(substate, Initializing | Executing) => {
            Some(P::Active { substate: Waiting })
        }
        (P::Active { substate }, T::Synchronize) if matches!(substate, Executing | Waiting) => {
            Some(P::Active {
                substate: Synchronizing,
            })
        }
        (P::Active { substate }, T::Finalize)
            if matches!(substate, Initializing | Executing | Waiting) =>
        {
            Some(P::Active {
                substate: Finalizing,
            })
        }
        (P::Active {
            substate: Finalizing,
        }, T::Complete) => Some(P::Completed),

        (P::Active { substate }, T::Pause) => Some(P::Paused {
            resume_to: substate,
            parked: false,
        }),
        (
            P::Paused {
                resume_to,
                parked: false,
            },
            T::Resume,
        ) => Some(P::Active {
            substate: resume_to,
        }),
        (P::Active { substate }, T::Escalate) => Some(P::Paused {
            resume_to: substate,
            parked: true,
        }),
        (P::Paused { resume_to, .. }, T::Escalate) => Some(P::Paused {
            resume_to,
            parked: true,
        }),
        (
            P::Paused {
                resume_to,
                parked: true,
            },
            T::ResolveManually,
        ) => Some(P::Active {
            substate: resume_to,
        }),

        (P::Active { .. } | P::Paused { .. }, T::Fail) => Some(P::Failed),
        (P::Pending | P::Active { .. } | P::Paused { .. }, T::Cancel) => Some(P::Cancelled),
        (P::Failed, T::Retry) => Some(P::Pending),
        _ => None,
    };

    next.ok_or_else(|| WorkflowError::InvalidTransition {
        state: phase.to_string(),
        trigger: trigger.name().to_string(),
    })
}

/// Checks that a replica in `to` may replace a local copy in `from`: both
/// share a status (substates may differ), or one edge of the table leads
/// from `from` to `to`.
pub fn replica_transition(from: WorkflowPhase, to: WorkflowPhase) -> Result<(), WorkflowError> {
    let same_status = from.status() == to.status() && from.is_parked() == to.is_parked();
    let one_edge = WorkflowTrigger::ALL
        .iter()
        .any(|trigger| matches!(transition(from, *trigger), Ok(next) if next == to));
    if same_status || one_edge {
        return Ok(());
    }
    Err(WorkflowError::InvalidTransition {
        state: from.to_string(),
        trigger: format!("adopt {to}"),
    })
}

/// Events driving the per-step machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTrigger {
    Start,
    Complete,
    Fail,
    Skip,
    /// A loop iteration finished; the step keeps running.
    Iterate,
    /// Recovery back-edge.
    Retry,
    /// Compensating back-edge issued by conflict resolution.
    Preempt,
}

impl StepTrigger {
    pub const ALL: [StepTrigger; 7] = [
        StepTrigger::Start,
        StepTrigger::Complete,
        StepTrigger::Fail,
        StepTrigger::Skip,
        StepTrigger::Iterate,
        StepTrigger::Retry,
        StepTrigger::Preempt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StepTrigger::Start => "start",
            StepTrigger::Complete => "complete",
            StepTrigger::Fail => "fail",
            StepTrigger::Skip => "skip",
            StepTrigger::Iterate => "iterate",
            StepTrigger::Retry => "retry",
            StepTrigger::Preempt => "preempt",
        }
    }
}

/// Looks up `(status, trigger)` in the step transition table.
pub fn step_transition(status: StepStatus, trigger: StepTrigger) -> Result<StepStatus, WorkflowError> {
    use StepStatus as S;
    use StepTrigger as T;

    let next = match (status, trigger) {
        (S::Pending, T::Start) => Some(S::Running),
        (S::Pending, T::Skip) => Some(S::Skipped),
        (S::Running, T::Complete) => Some(S::Completed),
        (S::Running, T::Fail) => Some(S::Failed),
        (S::Running, T::Skip) => Some(S::Skipped),
        (S::Running, T::Iterate) => Some(S::Running),
        (S::Failed, T::Retry) => Some(S::Pending),
        (S::Running | S::Pending, T::Preempt) => Some(S::Pending),
        _ => None,
    };

    next.ok_or_else(|| WorkflowError::InvalidTransition {
        state: format!("step {status:?}"),
        trigger: trigger.name().to_string(),
    })
}

#[cfg(test)]
mod tests;
