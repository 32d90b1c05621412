//! Sequenced workflow event store over a byte-level backend.

use crate::cache::SnapshotSource;
use crate::domain::errors::{StorageError, WorkflowError};
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::{TimestampUtc, WorkflowId};
use crate::domain::{WorkflowAggregate, WorkflowEvent};
use crate::event_store::backend::{InMemoryBackend, StorageBackend};
use crate::event_store::{EventMetadata, RecordedEvent};
use crate::recovery::is_checkpoint_stream;
use async_trait::async_trait;
use cqrs_es::{Aggregate, AggregateContext, AggregateError, DomainEvent, EventEnvelope, EventStore};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Event store for workflow aggregates.
///
/// Cheap to clone: clones share the backend.
#[derive(Clone)]
pub struct WorkflowEventStore {
    backend: Arc<dyn StorageBackend>,
    /// Snapshot after every N events (0 = disabled).
    snapshot_every: u64,
}

/// Aggregate context handed to `cqrs_es` between load and commit.
pub struct WorkflowAggregateContext {
    pub aggregate_id: String,
    pub aggregate: WorkflowAggregate,
    /// Sequence of the last applied event.
    pub current_sequence: u64,
}

impl AggregateContext<WorkflowAggregate> for WorkflowAggregateContext {
    fn aggregate(&self) -> &WorkflowAggregate {
        &self.aggregate
    }
}

impl WorkflowEventStore {
    pub fn new(backend: Arc<dyn StorageBackend>, snapshot_every: u64) -> Self {
        Self {
            backend,
            snapshot_every,
        }
    }

    pub fn in_memory(snapshot_every: u64) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), snapshot_every)
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    /// Appends one event; fails with a concurrency conflict unless
    /// `expected_sequence` is the current head. Returns the new sequence.
    pub async fn append(
        &self,
        workflow_id: &WorkflowId,
        event: WorkflowEvent,
        expected_sequence: u64,
        metadata: EventMetadata,
    ) -> Result<u64, WorkflowError> {
        let recorded = self
            .append_batch(workflow_id, vec![event], expected_sequence, metadata)
            .await?;
        Ok(recorded.last().map_or(expected_sequence, |r| r.sequence))
    }

    /// Appends several events atomically under one expected head.
    pub async fn append_batch(
        &self,
        workflow_id: &WorkflowId,
        events: Vec<WorkflowEvent>,
        expected_sequence: u64,
        metadata: EventMetadata,
    ) -> Result<Vec<RecordedEvent>, WorkflowError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let recorded_at = TimestampUtc::now();
        let records: Vec<RecordedEvent> = events
            .into_iter()
            .zip(expected_sequence + 1..)
            .map(|(event, sequence)| RecordedEvent {
                event_id: Uuid::new_v4(),
                workflow_id: workflow_id.clone(),
                sequence,
                event_type: event.event_type(),
                event_version: event.event_version(),
                recorded_at,
                causation_id: metadata.causation_id,
                correlation_id: metadata.correlation_id,
                event,
            })
            .collect();

        let bytes = records
            .iter()
            .map(|record| serde_json::to_vec(record).map_err(StorageError::from))
            .collect::<Result<Vec<_>, _>>()?;

        match self
            .backend
            .append(workflow_id.as_str(), expected_sequence, bytes)
            .await
        {
            Ok(_) => Ok(records),
            Err(StorageError::SequenceMismatch {
                expected, actual, ..
            }) => Err(WorkflowError::ConcurrencyConflict {
                message: format!(
                    "workflow {workflow_id}: expected sequence {expected}, head is {actual}"
                ),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Events with sequence >= `from_sequence`, in order.
    pub async fn read(
        &self,
        workflow_id: &WorkflowId,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent>, WorkflowError> {
        let from = from_sequence.max(1);
        let raw = self.backend.read_range(workflow_id.as_str(), from).await?;
        raw.iter()
            .zip(from..)
            .map(|(bytes, expected)| decode_record(workflow_id, bytes, expected))
            .collect()
    }

    pub async fn head(&self, workflow_id: &WorkflowId) -> Result<u64, WorkflowError> {
        Ok(self.backend.head(workflow_id.as_str()).await?)
    }

    /// Persists a snapshot; rejects one that is ahead of the log.
    pub async fn save_snapshot(&self, snapshot: &WorkflowSnapshot) -> Result<(), WorkflowError> {
        let head = self.head(&snapshot.workflow_id).await?;
        if snapshot.sequence > head {
            return Err(WorkflowError::validation(format!(
                "snapshot sequence {} exceeds head {head} of {}",
                snapshot.sequence, snapshot.workflow_id
            )));
        }
        let bytes = serde_json::to_vec(snapshot).map_err(StorageError::from)?;
        self.backend
            .write_snapshot(snapshot.workflow_id.as_str(), snapshot.sequence, bytes)
            .await?;
        Ok(())
    }

    /// Latest persisted snapshot, without replaying the tail.
    pub async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowSnapshot>, WorkflowError> {
        let Some((sequence, bytes)) = self.backend.read_latest(workflow_id.as_str()).await? else {
            return Ok(None);
        };
        let snapshot: WorkflowSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                stream: workflow_id.to_string(),
                message: format!("snapshot: {e}"),
            })?;
        if snapshot.sequence != sequence {
            return Err(StorageError::Corrupt {
                stream: workflow_id.to_string(),
                message: format!(
                    "snapshot header says {sequence}, body says {}",
                    snapshot.sequence
                ),
            }
            .into());
        }
        Ok(Some(snapshot))
    }

    /// Current state: latest snapshot plus the replayed tail.
    pub async fn load_snapshot(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowSnapshot>, WorkflowError> {
        Ok(self.load_aggregate_state(workflow_id).await?.into_snapshot())
    }

    /// Full replay of the log from empty state.
    pub async fn replay(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowSnapshot>, WorkflowError> {
        let mut aggregate = WorkflowAggregate::default();
        for record in self.read(workflow_id, 1).await? {
            aggregate.apply(record.event);
        }
        Ok(aggregate.into_snapshot())
    }

    /// Workflows with events in the backend. Checkpoint streams sharing the
    /// backend are not workflows and are left out.
    pub async fn workflow_ids(&self) -> Result<Vec<WorkflowId>, WorkflowError> {
        Ok(self
            .backend
            .streams()
            .await?
            .into_iter()
            .filter(|stream| !is_checkpoint_stream(stream))
            .map(WorkflowId::from)
            .collect())
    }

    async fn load_aggregate_state(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowAggregate, WorkflowError> {
        let mut aggregate = WorkflowAggregate::default();
        let mut from = 1;
        if let Some(snapshot) = self.latest_snapshot(workflow_id).await? {
            from = snapshot.sequence + 1;
            aggregate = WorkflowAggregate::from_snapshot(snapshot);
        }
        for record in self.read(workflow_id, from).await? {
            aggregate.apply(record.event);
        }
        Ok(aggregate)
    }
}

fn decode_record(
    workflow_id: &WorkflowId,
    bytes: &[u8],
    expected_sequence: u64,
) -> Result<RecordedEvent, WorkflowError> {
    let corrupt = |message: String| StorageError::Corrupt {
        stream: workflow_id.to_string(),
        message,
    };
    let record: RecordedEvent = serde_json::from_slice(bytes)
        .map_err(|e| corrupt(format!("record {expected_sequence}: {e}")))?;

    if record.sequence != expected_sequence {
        return Err(corrupt(format!(
            "record at position {expected_sequence} carries sequence {}",
            record.sequence
        ))
        .into());
    }
    // Validate event type and version match
    if record.event_type != record.event.event_type()
        || record.event_version != record.event.event_version()
    {
        return Err(corrupt(format!(
            "record {expected_sequence}: event version/type mismatch"
        ))
        .into());
    }
    Ok(record)
}

/// Determines if a snapshot should be taken based on sequence and threshold.
fn should_snapshot(sequence: u64, snapshot_every: u64) -> bool {
    if snapshot_every == 0 {
        return false;
    }
    sequence.is_multiple_of(snapshot_every)
}

fn unexpected(err: WorkflowError) -> AggregateError<WorkflowError> {
    match err {
        WorkflowError::ConcurrencyConflict { .. } => AggregateError::AggregateConflict,
        other => AggregateError::UnexpectedError(Box::new(other)),
    }
}

#[async_trait]
impl EventStore<WorkflowAggregate> for WorkflowEventStore {
    type AC = WorkflowAggregateContext;

    async fn load_events(
        &self,
        aggregate_id: &str,
    ) -> Result<Vec<EventEnvelope<WorkflowAggregate>>, AggregateError<WorkflowError>> {
        let records = self
            .read(&WorkflowId::from(aggregate_id), 1)
            .await
            .map_err(unexpected)?;
        Ok(records.iter().map(RecordedEvent::to_envelope).collect())
    }

    async fn load_aggregate(
        &self,
        aggregate_id: &str,
    ) -> Result<Self::AC, AggregateError<WorkflowError>> {
        let aggregate = self
            .load_aggregate_state(&WorkflowId::from(aggregate_id))
            .await
            .map_err(unexpected)?;
        Ok(WorkflowAggregateContext {
            aggregate_id: aggregate_id.to_string(),
            current_sequence: aggregate.sequence(),
            aggregate,
        })
    }

    async fn commit(
        &self,
        events: Vec<WorkflowEvent>,
        context: Self::AC,
        metadata: HashMap<String, String>,
    ) -> Result<Vec<EventEnvelope<WorkflowAggregate>>, AggregateError<WorkflowError>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let WorkflowAggregateContext {
            aggregate_id,
            mut aggregate,
            current_sequence,
        } = context;
        let workflow_id = WorkflowId::from(aggregate_id);

        let records = self
            .append_batch(
                &workflow_id,
                events,
                current_sequence,
                EventMetadata::from_map(&metadata),
            )
            .await
            .map_err(unexpected)?;

        for record in &records {
            aggregate.apply(record.event.clone());
        }

        // Take snapshot if threshold reached
        let crossed = records
            .iter()
            .any(|record| should_snapshot(record.sequence, self.snapshot_every));
        if crossed {
            if let Some(snapshot) = aggregate.snapshot() {
                if let Err(err) = self.save_snapshot(snapshot).await {
                    tracing::warn!(workflow_id = %workflow_id, error = %err, "Snapshot write failed");
                }
            }
        }

        Ok(records.iter().map(RecordedEvent::to_envelope).collect())
    }
}

#[async_trait]
impl SnapshotSource for WorkflowEventStore {
    async fn rebuild(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowSnapshot>, WorkflowError> {
        self.load_snapshot(workflow_id).await
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
