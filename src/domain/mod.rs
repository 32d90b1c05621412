//! Domain model for event-sourced workflow state management.
//!
//! Every state change is a command validated by [`WorkflowAggregate`] and
//! recorded as a [`WorkflowEvent`]. A [`WorkflowSnapshot`] is the fold of a
//! workflow's events and is what callers read.
//!
//! # Architecture
//!
//! - **Commands** (`cqrs/commands.rs`): intent to change state
//! - **Events** (`cqrs/events.rs`): facts that have happened
//! - **Aggregate** (`cqrs/mod.rs`): command validation and event application
//! - **Projection** (`cqrs/query.rs`): write-through into the tiered cache
//! - **Actor** (`actor.rs`): one mailbox per workflow, serializing its commands
//!
//! ```ignore
//! let outcome = engine.submit(&workflow_id, WorkflowCommand::Activate).await?;
//! assert_eq!(outcome.snapshot.status(), WorkflowStatus::Active);
//! ```

pub mod actor;
pub mod condition;
pub mod cqrs;
pub mod errors;
pub mod failure;
pub mod services;
pub mod snapshot;
pub mod supervisor;
pub mod types;

pub use cqrs::*;

pub use actor::{
    CommandEnvelope, CommandOutcome, Committed, WorkflowActor, WorkflowActorArgs, WorkflowMessage,
};
pub use condition::Condition;
pub use errors::{Rejected, StorageError, TransportError, WorkflowError};
pub use failure::{FailureKind, FailureSignal, RecoveryStrategy};
pub use services::{WorkflowClock, WorkflowServices};
pub use snapshot::{ExecutionState, StepState, WorkflowSnapshot};
pub use supervisor::{SupervisorMsg, WorkflowSupervisor};
pub use types::{
    ActiveSubstate, AgentId, RetryPolicy, StepConstraints, StepId, StepStatus, StepType,
    TimeWindow, TimestampUtc, WorkflowDefinition, WorkflowId, WorkflowStatus,
    WorkflowStepDefinition,
};
