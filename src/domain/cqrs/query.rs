//! CQRS query handler that projects committed events into the state cache.
//!
//! Runs inside `CqrsFramework::execute`, after the commit and before the
//! command returns, so the hot tier reflects every committed event by the
//! time the caller sees the outcome.

use super::WorkflowAggregate;
use crate::cache::TieredCache;
use crate::domain::types::WorkflowId;
use crate::event_store::RecordedEvent;
use async_trait::async_trait;
use cqrs_es::{EventEnvelope, Query};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct SnapshotProjection {
    cache: Arc<TieredCache>,
    event_tx: broadcast::Sender<RecordedEvent>,
}

impl SnapshotProjection {
    pub fn new(cache: Arc<TieredCache>, event_tx: broadcast::Sender<RecordedEvent>) -> Self {
        Self { cache, event_tx }
    }

    async fn project(
        &self,
        workflow_id: &WorkflowId,
        events: &[EventEnvelope<WorkflowAggregate>],
    ) {
        // A miss rebuilds from the store, which already holds this commit.
        let base = match self.cache.get(workflow_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::warn!(workflow_id = %workflow_id, "Committed events for a workflow the store cannot rebuild");
                return;
            }
            Err(err) => {
                tracing::warn!(workflow_id = %workflow_id, error = %err, "Projection rebuild failed");
                self.cache.invalidate(workflow_id);
                return;
            }
        };

        let mut snapshot = (*base).clone();
        let mut advanced = false;
        for envelope in events {
            let sequence = envelope.sequence as u64;
            if sequence <= snapshot.sequence {
                continue;
            }
            if sequence != snapshot.sequence + 1 {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    cached = snapshot.sequence,
                    incoming = sequence,
                    "Projection gap, dropping cached snapshot"
                );
                self.cache.invalidate(workflow_id);
                return;
            }
            snapshot.apply(&envelope.payload);
            advanced = true;
        }

        if advanced {
            self.cache.put(Arc::new(snapshot));
        }
    }
}

#[async_trait]
impl Query<WorkflowAggregate> for SnapshotProjection {
    async fn dispatch(&self, aggregate_id: &str, events: &[EventEnvelope<WorkflowAggregate>]) {
        let workflow_id = WorkflowId::from(aggregate_id);
        self.project(&workflow_id, events).await;

        for envelope in events {
            let Some(record) = RecordedEvent::from_envelope(envelope) else {
                tracing::warn!(workflow_id = %workflow_id, sequence = envelope.sequence, "Envelope without record metadata");
                continue;
            };
            // No subscribers is fine.
            let _ = self.event_tx.send(record);
        }
    }
}

#[cfg(test)]
#[path = "../tests/query_tests.rs"]
mod tests;
