//! Transport to the cloud-canonical copy.

use super::ReplicaState;
use crate::domain::errors::TransportError;
use crate::domain::types::WorkflowId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Remote calls are the transport's business: retries and per-call
/// timeouts live behind this trait.
#[async_trait]
pub trait EdgeCloudTransport: Send + Sync + 'static {
    async fn get_remote_state(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<ReplicaState>, TransportError>;

    async fn put_remote_state(&self, state: &ReplicaState) -> Result<(), TransportError>;
}

/// In-process stand-in for the cloud store.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    states: Mutex<HashMap<WorkflowId, ReplicaState>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    puts: AtomicU64,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the cloud copy directly, as another edge node would.
    pub fn seed(&self, state: ReplicaState) {
        self.states.lock().insert(state.workflow_id.clone(), state);
    }

    pub fn state(&self, workflow_id: &WorkflowId) -> Option<ReplicaState> {
        self.states.lock().get(workflow_id).cloned()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of accepted writes.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    async fn round_trip(&self) -> Result<(), TransportError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable {
                message: "cloud endpoint offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EdgeCloudTransport for InMemoryCloud {
    async fn get_remote_state(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<ReplicaState>, TransportError> {
        self.round_trip().await?;
        Ok(self.states.lock().get(workflow_id).cloned())
    }

    async fn put_remote_state(&self, state: &ReplicaState) -> Result<(), TransportError> {
        self.round_trip().await?;
        self.states
            .lock()
            .insert(state.workflow_id.clone(), state.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
