//! Edge/cloud reconciliation.
//!
//! The edge copy of a workflow is the engine's own snapshot; the cloud copy
//! is reached through an injected [`EdgeCloudTransport`]. The configured
//! [`ConsistencyLevel`] decides whether a change is reconciled before the
//! caller continues or queued for the background worker.
//!
//! The cloud is the single authoritative replica. There is no quorum.

pub mod resolve;
pub mod transport;

pub use resolve::{resolve, Resolution, ResolutionRule, Side};
pub use transport::{EdgeCloudTransport, InMemoryCloud};

use crate::config::ConsistencyConfig;
use crate::domain::errors::{TransportError, WorkflowError};
use crate::domain::snapshot::{ExecutionState, WorkflowSnapshot};
use crate::domain::types::{ActiveSubstate, TimestampUtc, WorkflowId, WorkflowStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

/// Global context key holding a workflow's domain flags.
pub const DOMAIN_FLAGS_KEY: &str = "domain_flags";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// The caller waits until both copies agree.
    Strong,
    #[default]
    Eventual,
    /// Reconcile immediately only past the configured time or version drift.
    BoundedStaleness,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::Strong => "strong",
            ConsistencyLevel::Eventual => "eventual",
            ConsistencyLevel::BoundedStaleness => "bounded_staleness",
        };
        f.write_str(name)
    }
}

/// Semantic precedence of a change. Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainFlag {
    Efficiency,
    Quality,
    Safety,
}

impl DomainFlag {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "efficiency" => Some(DomainFlag::Efficiency),
            "quality" => Some(DomainFlag::Quality),
            "safety" => Some(DomainFlag::Safety),
            _ => None,
        }
    }
}

/// The replicated projection of a workflow snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub workflow_id: WorkflowId,
    pub version: u64,
    pub timestamp: TimestampUtc,
    pub state: ExecutionState,
    #[serde(default)]
    pub domain_flags: BTreeSet<DomainFlag>,
    /// Produced by a concurrent-modification merge.
    #[serde(default)]
    pub merged: bool,
}

impl ReplicaState {
    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Self {
        let domain_flags = snapshot
            .global_context
            .get(DOMAIN_FLAGS_KEY)
            .and_then(|flags| flags.as_array())
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(|flag| flag.as_str().and_then(DomainFlag::parse))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            workflow_id: snapshot.workflow_id.clone(),
            version: snapshot.sequence,
            timestamp: snapshot.updated_at,
            state: snapshot.execution_state(),
            domain_flags,
            merged: false,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.phase.status()
    }

    pub fn substate(&self) -> Option<ActiveSubstate> {
        self.state.phase.substate()
    }
}

/// Result of reconciling one edge copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub workflow_id: WorkflowId,
    /// Edge version the reconciliation started from.
    pub local_version: u64,
    pub rule: ResolutionRule,
    pub winner: Side,
    pub state: ReplicaState,
    /// The agreed state differs from the edge copy, which must adopt it.
    pub adopt: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Reconciled(Reconciled),
    Queued,
}

/// What the background worker reports back to the engine.
#[derive(Debug, Clone)]
pub enum ConsistencyEvent {
    Reconciled(Reconciled),
    Failed {
        workflow_id: WorkflowId,
        error: WorkflowError,
    },
}

pub struct ConsistencyManager {
    config: ConsistencyConfig,
    transport: Arc<dyn EdgeCloudTransport>,
    /// Last state both copies agreed on.
    agreed: DashMap<WorkflowId, ReplicaState>,
    /// Latest queued edge copy per workflow; newer changes overwrite older ones.
    pending: DashMap<WorkflowId, ReplicaState>,
    wake: Notify,
}

impl ConsistencyManager {
    pub fn new(config: ConsistencyConfig, transport: Arc<dyn EdgeCloudTransport>) -> Self {
        Self {
            config,
            transport,
            agreed: DashMap::new(),
            pending: DashMap::new(),
            wake: Notify::new(),
        }
    }

    pub fn level(&self) -> ConsistencyLevel {
        self.config.level
    }

    pub fn agreed(&self, workflow_id: &WorkflowId) -> Option<ReplicaState> {
        self.agreed.get(workflow_id).map(|state| state.clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Propagates an edge change according to the configured level.
    pub async fn sync(&self, local: ReplicaState) -> Result<SyncOutcome, WorkflowError> {
        let immediate = match self.config.level {
            ConsistencyLevel::Strong => true,
            ConsistencyLevel::Eventual => false,
            ConsistencyLevel::BoundedStaleness => self.exceeds_bounds(&local),
        };
        if immediate {
            self.pending.remove(&local.workflow_id);
            return self.reconcile(local).await.map(SyncOutcome::Reconciled);
        }
        self.enqueue(local);
        Ok(SyncOutcome::Queued)
    }

    fn exceeds_bounds(&self, local: &ReplicaState) -> bool {
        let Some(agreed) = self.agreed.get(&local.workflow_id) else {
            return true;
        };
        local.version.saturating_sub(agreed.version) > self.config.max_version_lag
            || local.timestamp.millis_since(&agreed.timestamp) > self.config.max_staleness_ms
    }

    fn enqueue(&self, local: ReplicaState) {
        tracing::debug!(
            workflow_id = %local.workflow_id,
            version = local.version,
            "Queued replica for reconciliation"
        );
        self.pending.insert(local.workflow_id.clone(), local);
        self.wake.notify_one();
    }

    /// One reconciliation pass, bounded by the configured timeout.
    pub async fn reconcile(&self, local: ReplicaState) -> Result<Reconciled, WorkflowError> {
        let millis = self.config.timeout_ms;
        match tokio::time::timeout(self.config.timeout(), self.round_trip(local)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { millis }.into()),
        }
    }

    async fn round_trip(&self, local: ReplicaState) -> Result<Reconciled, WorkflowError> {
        let workflow_id = local.workflow_id.clone();
        let remote = self.transport.get_remote_state(&workflow_id).await?;

        let resolution = match &remote {
            Some(remote) => {
                let base = self.agreed(&workflow_id);
                resolve(&local, remote, base.as_ref())
            }
            None => Resolution {
                rule: ResolutionRule::LastWriteWins,
                winner: Side::Local,
                state: local.clone(),
            },
        };

        if remote.as_ref() != Some(&resolution.state) {
            self.transport.put_remote_state(&resolution.state).await?;
        }
        self.agreed
            .insert(workflow_id.clone(), resolution.state.clone());

        let adopt = resolution.state.state != local.state;
        tracing::debug!(
            workflow_id = %workflow_id,
            rule = %resolution.rule,
            adopt,
            "Replica reconciled"
        );
        Ok(Reconciled {
            workflow_id,
            local_version: local.version,
            rule: resolution.rule,
            winner: resolution.winner,
            state: resolution.state,
            adopt,
        })
    }

    /// Drains at most `queue_capacity` queued copies. Returns how many ran.
    pub async fn drain(&self, events: &mpsc::Sender<ConsistencyEvent>) -> usize {
        let ids: Vec<WorkflowId> = self
            .pending
            .iter()
            .take(self.config.queue_capacity)
            .map(|entry| entry.key().clone())
            .collect();

        let mut processed = 0;
        for workflow_id in ids {
            let Some((_, local)) = self.pending.remove(&workflow_id) else {
                continue;
            };
            processed += 1;
            let event = match self.reconcile(local).await {
                Ok(reconciled) => ConsistencyEvent::Reconciled(reconciled),
                Err(error) => {
                    tracing::warn!(workflow_id = %workflow_id, error = %error, "Reconciliation failed");
                    ConsistencyEvent::Failed { workflow_id, error }
                }
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
        if !self.pending.is_empty() {
            self.wake.notify_one();
        }
        processed
    }

    /// Background worker for eventual and bounded-staleness changes.
    pub fn spawn_worker(
        self: &Arc<Self>,
        events: mpsc::Sender<ConsistencyEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.wake.notified() => {
                        manager.drain(&events).await;
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Consistency worker stopping due to shutdown");
                        break;
                    }
                }
            }
        })
    }

    /// Forgets everything about a retired workflow.
    pub fn forget(&self, workflow_id: &WorkflowId) {
        self.agreed.remove(workflow_id);
        self.pending.remove(workflow_id);
    }
}

#[cfg(test)]
#[path = "tests/consistency_tests.rs"]
mod tests;
