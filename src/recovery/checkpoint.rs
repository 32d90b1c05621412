//! Immutable recovery checkpoints and their write-once store.
//!
//! Checkpoints are appended to a per-workflow stream of the storage
//! backend, so they survive restarts alongside the event log. A bounded
//! window of recent checkpoints per workflow is kept in memory.

use crate::domain::errors::{StorageError, WorkflowError};
use crate::domain::snapshot::{ExecutionState, WorkflowSnapshot};
use crate::domain::types::{AgentId, StepId, TimestampUtc, WorkflowId};
use crate::event_store::StorageBackend;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

const STREAM_PREFIX: &str = "checkpoints.";

/// Snapshot plus agent state plus resource allocations at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    /// Snapshot sequence the checkpoint was taken at.
    pub sequence: u64,
    /// Phase boundary that triggered the capture.
    pub label: String,
    pub state: ExecutionState,
    #[serde(default)]
    pub agent_states: BTreeMap<AgentId, Value>,
    /// Resource name to the step holding it.
    #[serde(default)]
    pub resource_allocations: BTreeMap<String, StepId>,
    pub created_at: TimestampUtc,
    /// Hex SHA-256 over every field above.
    pub digest: String,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    id: &'a Uuid,
    workflow_id: &'a WorkflowId,
    sequence: u64,
    label: &'a str,
    state: &'a ExecutionState,
    agent_states: &'a BTreeMap<AgentId, Value>,
    resource_allocations: &'a BTreeMap<String, StepId>,
    created_at: &'a TimestampUtc,
}

impl RecoveryCheckpoint {
    /// Captures `snapshot`. Agent state is whatever the caller knows about
    /// the assigned agents; resource allocations come from running steps.
    pub fn capture(
        snapshot: &WorkflowSnapshot,
        label: impl Into<String>,
        agent_states: BTreeMap<AgentId, Value>,
    ) -> Self {
        let mut resource_allocations = BTreeMap::new();
        for (step_id, _) in snapshot.running_steps() {
            if let Some(definition) = snapshot.definition.step(step_id) {
                for resource in &definition.constraints.resources {
                    resource_allocations.insert(resource.clone(), step_id.clone());
                }
            }
        }

        let mut checkpoint = Self {
            id: Uuid::new_v4(),
            workflow_id: snapshot.workflow_id.clone(),
            sequence: snapshot.sequence,
            label: label.into(),
            state: snapshot.execution_state(),
            agent_states,
            resource_allocations,
            created_at: TimestampUtc::now(),
            digest: String::new(),
        };
        checkpoint.digest = checkpoint.compute_digest();
        checkpoint
    }

    pub fn compute_digest(&self) -> String {
        let input = DigestInput {
            id: &self.id,
            workflow_id: &self.workflow_id,
            sequence: self.sequence,
            label: &self.label,
            state: &self.state,
            agent_states: &self.agent_states,
            resource_allocations: &self.resource_allocations,
            created_at: &self.created_at,
        };
        let mut hasher = Sha256::new();
        // Serializing plain data into a Vec cannot fail; an empty hash input
        // would still never match a stored digest.
        hasher.update(serde_json::to_vec(&input).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    /// Fails with a corruption error when the content no longer matches the digest.
    pub fn verify(&self) -> Result<(), WorkflowError> {
        let actual = self.compute_digest();
        if actual != self.digest {
            return Err(StorageError::Corrupt {
                stream: stream_name(&self.workflow_id),
                message: format!(
                    "checkpoint {} digest mismatch (stored {}, computed {actual})",
                    self.id, self.digest
                ),
            }
            .into());
        }
        Ok(())
    }
}

fn stream_name(workflow_id: &WorkflowId) -> String {
    format!("{STREAM_PREFIX}{workflow_id}")
}

/// Whether a backend stream holds checkpoints rather than workflow events.
pub fn is_checkpoint_stream(stream: &str) -> bool {
    stream.starts_with(STREAM_PREFIX)
}

/// Write-once checkpoint store over a storage backend.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn StorageBackend>,
    recent: Arc<DashMap<WorkflowId, VecDeque<RecoveryCheckpoint>>>,
    keep: usize,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StorageBackend>, keep: usize) -> Self {
        Self {
            backend,
            recent: Arc::new(DashMap::new()),
            keep: keep.max(1),
        }
    }

    /// Persists a checkpoint. A checkpoint id can only ever be saved once.
    pub async fn save(&self, checkpoint: &RecoveryCheckpoint) -> Result<(), WorkflowError> {
        self.ensure_loaded(&checkpoint.workflow_id).await?;
        let duplicate = self
            .recent
            .get(&checkpoint.workflow_id)
            .is_some_and(|kept| kept.iter().any(|c| c.id == checkpoint.id));
        if duplicate {
            return Err(WorkflowError::validation(format!(
                "checkpoint {} is already recorded",
                checkpoint.id
            )));
        }

        let stream = stream_name(&checkpoint.workflow_id);
        let bytes = serde_json::to_vec(checkpoint).map_err(StorageError::from)?;
        let head = self.backend.head(&stream).await?;
        self.backend.append(&stream, head, vec![bytes]).await?;

        let mut kept = self
            .recent
            .entry(checkpoint.workflow_id.clone())
            .or_default();
        kept.push_back(checkpoint.clone());
        while kept.len() > self.keep {
            kept.pop_front();
        }
        tracing::debug!(
            workflow_id = %checkpoint.workflow_id,
            checkpoint_id = %checkpoint.id,
            label = %checkpoint.label,
            sequence = checkpoint.sequence,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Most recent checkpoint of the workflow.
    pub async fn latest(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<RecoveryCheckpoint>, WorkflowError> {
        self.ensure_loaded(workflow_id).await?;
        Ok(self
            .recent
            .get(workflow_id)
            .and_then(|kept| kept.back().cloned()))
    }

    pub async fn get(
        &self,
        workflow_id: &WorkflowId,
        checkpoint_id: Uuid,
    ) -> Result<Option<RecoveryCheckpoint>, WorkflowError> {
        self.ensure_loaded(workflow_id).await?;
        Ok(self.recent.get(workflow_id).and_then(|kept| {
            kept.iter()
                .find(|checkpoint| checkpoint.id == checkpoint_id)
                .cloned()
        }))
    }

    /// Checkpoints kept in memory, oldest first.
    pub async fn list(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<RecoveryCheckpoint>, WorkflowError> {
        self.ensure_loaded(workflow_id).await?;
        Ok(self
            .recent
            .get(workflow_id)
            .map(|kept| kept.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Drops the in-memory window; the persisted stream is untouched.
    pub fn evict(&self, workflow_id: &WorkflowId) {
        self.recent.remove(workflow_id);
    }

    async fn ensure_loaded(&self, workflow_id: &WorkflowId) -> Result<(), WorkflowError> {
        if self.recent.contains_key(workflow_id) {
            return Ok(());
        }
        let stream = stream_name(workflow_id);
        let records = self.backend.read_range(&stream, 1).await?;
        let mut kept = VecDeque::new();
        for bytes in records {
            let checkpoint: RecoveryCheckpoint =
                serde_json::from_slice(&bytes).map_err(|err| StorageError::Corrupt {
                    stream: stream.clone(),
                    message: err.to_string(),
                })?;
            kept.push_back(checkpoint);
            if kept.len() > self.keep {
                kept.pop_front();
            }
        }
        self.recent.entry(workflow_id.clone()).or_insert(kept);
        Ok(())
    }
}
