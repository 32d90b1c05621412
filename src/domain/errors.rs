//! Error taxonomy for the workflow engine.

use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::WorkflowId;
use std::sync::Arc;
use thiserror::Error;

/// Domain error for all workflow operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// Malformed command or request, rejected before anything is recorded.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The (state, trigger) pair is absent from the transition table.
    #[error("trigger '{trigger}' is not allowed in state {state}")]
    InvalidTransition { state: String, trigger: String },

    /// Stale expected sequence on append. Re-read and retry.
    #[error("concurrency conflict: {message}")]
    ConcurrencyConflict { message: String },

    /// Edge insertion rejected, graph unchanged.
    #[error("dependency {from} -> {to} would create a cycle")]
    CyclicDependency { from: WorkflowId, to: WorkflowId },

    /// A barrier stayed closed past the stall timeout.
    #[error("coordination timeout at synchronization point {point}")]
    CoordinationTimeout { point: String },

    /// Conflict escalated; the workflow is parked for manual resolution.
    #[error("conflict unresolved: {message}")]
    ConflictUnresolved { message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("workflow {0} not found")]
    NotFound(WorkflowId),

    #[error("workflow not initialized")]
    NotInitialized,

    #[error("workflow {0} is cancelled")]
    Cancelled(WorkflowId),
}

impl WorkflowError {
    pub fn validation(message: impl Into<String>) -> Self {
        WorkflowError::Validation {
            message: message.into(),
        }
    }

    /// Validation and concurrency errors are the caller's to retry with fresh state.
    pub fn is_caller_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Validation { .. }
                | WorkflowError::InvalidTransition { .. }
                | WorkflowError::ConcurrencyConflict { .. }
        )
    }
}

/// Errors raised by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("stream {stream}: expected head {expected}, found {actual}")]
    SequenceMismatch {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("storage I/O failure: {message}")]
    Io { message: String },

    #[error("corrupt record in {stream}: {message}")]
    Corrupt { stream: String, message: String },

    #[error("serialization failure: {message}")]
    Serialization { message: String },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Errors raised by the edge/cloud transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("remote call timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("remote unavailable: {message}")]
    Unavailable { message: String },

    #[error("remote rejected the update: {message}")]
    Rejected { message: String },
}

/// A rejected engine operation, paired with the authoritative snapshot.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct Rejected {
    pub error: WorkflowError,
    pub snapshot: Option<Arc<WorkflowSnapshot>>,
}

impl Rejected {
    pub fn new(error: WorkflowError, snapshot: Option<Arc<WorkflowSnapshot>>) -> Self {
        Self { error, snapshot }
    }
}

impl From<WorkflowError> for Rejected {
    fn from(error: WorkflowError) -> Self {
        Self {
            error,
            snapshot: None,
        }
    }
}
