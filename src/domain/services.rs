//! Services injected into the workflow aggregate.
//!
//! The aggregate never reads the system clock directly, so command handling
//! can be pinned to a fixed instant in tests and tooling.

use crate::domain::types::TimestampUtc;

#[derive(Debug, Clone, Default)]
pub struct WorkflowServices {
    pub clock: WorkflowClock,
}

impl WorkflowServices {
    pub fn with_clock(clock: WorkflowClock) -> Self {
        Self { clock }
    }
}

/// Wall clock, or a frozen instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowClock {
    frozen: Option<TimestampUtc>,
}

impl WorkflowClock {
    pub fn fixed(at: TimestampUtc) -> Self {
        Self { frozen: Some(at) }
    }

    pub fn now(&self) -> TimestampUtc {
        self.frozen.unwrap_or_else(TimestampUtc::now)
    }
}
