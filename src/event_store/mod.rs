//! Append-only event store for workflow event sourcing.
//!
//! Events are persisted through a pluggable [`StorageBackend`] that only
//! deals in bytes. [`WorkflowEventStore`] layers sequencing, optimistic
//! concurrency, snapshots and replay on top, and is the `cqrs_es` event
//! store of the workflow aggregate.

pub mod backend;
pub mod file_store;
pub mod store;

pub use backend::{InMemoryBackend, StorageBackend};
pub use file_store::FileBackend;
pub use store::{WorkflowAggregateContext, WorkflowEventStore};

use crate::domain::cqrs::WorkflowEvent;
use crate::domain::types::{TimestampUtc, WorkflowId};
use crate::domain::WorkflowAggregate;
use cqrs_es::EventEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

const META_EVENT_ID: &str = "event_id";
const META_RECORDED_AT: &str = "recorded_at";
const META_CAUSATION_ID: &str = "causation_id";
const META_CORRELATION_ID: &str = "correlation_id";

/// An event as persisted in a workflow's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub workflow_id: WorkflowId,
    pub sequence: u64,
    pub event_type: String,
    pub event_version: String,
    pub recorded_at: TimestampUtc,
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    pub event: WorkflowEvent,
}

impl RecordedEvent {
    /// Metadata map carried on the `cqrs_es` envelope.
    pub fn envelope_metadata(&self) -> HashMap<String, String> {
        let mut metadata = EventMetadata {
            causation_id: self.causation_id,
            correlation_id: self.correlation_id,
        }
        .to_map();
        metadata.insert(META_EVENT_ID.to_string(), self.event_id.to_string());
        metadata.insert(META_RECORDED_AT.to_string(), self.recorded_at.to_rfc3339());
        metadata
    }

    pub fn to_envelope(&self) -> EventEnvelope<WorkflowAggregate> {
        EventEnvelope {
            aggregate_id: self.workflow_id.to_string(),
            sequence: usize::try_from(self.sequence).unwrap_or(usize::MAX),
            payload: self.event.clone(),
            metadata: self.envelope_metadata(),
        }
    }

    /// Rebuilds a record from an envelope produced by [`WorkflowEventStore`].
    pub fn from_envelope(envelope: &EventEnvelope<WorkflowAggregate>) -> Option<Self> {
        use cqrs_es::DomainEvent;

        let event_id = envelope
            .metadata
            .get(META_EVENT_ID)
            .and_then(|raw| Uuid::parse_str(raw).ok())?;
        let recorded_at = envelope
            .metadata
            .get(META_RECORDED_AT)
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| TimestampUtc(ts.with_timezone(&chrono::Utc)))?;
        let meta = EventMetadata::from_map(&envelope.metadata);
        Some(Self {
            event_id,
            workflow_id: WorkflowId::from(envelope.aggregate_id.as_str()),
            sequence: envelope.sequence as u64,
            event_type: envelope.payload.event_type(),
            event_version: envelope.payload.event_version(),
            recorded_at,
            causation_id: meta.causation_id,
            correlation_id: meta.correlation_id,
            event: envelope.payload.clone(),
        })
    }
}

/// Causation and correlation ids stamped on every event of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub causation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn correlated(correlation_id: Uuid) -> Self {
        Self {
            causation_id: None,
            correlation_id: Some(correlation_id),
        }
    }

    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(id) = self.causation_id {
            map.insert(META_CAUSATION_ID.to_string(), id.to_string());
        }
        if let Some(id) = self.correlation_id {
            map.insert(META_CORRELATION_ID.to_string(), id.to_string());
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let parse = |key: &str| map.get(key).and_then(|raw| Uuid::parse_str(raw).ok());
        Self {
            causation_id: parse(META_CAUSATION_ID),
            correlation_id: parse(META_CORRELATION_ID),
        }
    }
}
