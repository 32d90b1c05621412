//! Tiered snapshot cache.
//!
//! Reads go hot -> warm -> rebuild from the event store, promoting on each
//! hit. Writes land in the hot tier synchronously; warm-tier and index
//! updates are queued and drained by the maintenance task or by the next
//! warm/index read, whichever comes first.

mod index;

pub use index::SecondaryIndices;

use crate::domain::errors::WorkflowError;
use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::{AgentId, WorkflowId, WorkflowStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Authoritative fallback used on a miss in both tiers.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn rebuild(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowSnapshot>, WorkflowError>;
}

enum PendingUpdate {
    /// A fresh write: refresh warm and the indices.
    Write(Arc<WorkflowSnapshot>),
    /// Evicted from hot: keep it warm.
    Demote(Arc<WorkflowSnapshot>),
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub rebuilds: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    rebuilds: AtomicU64,
    misses: AtomicU64,
}

pub struct TieredCache {
    hot: Mutex<LruCache<WorkflowId, Arc<WorkflowSnapshot>>>,
    warm: Mutex<LruCache<WorkflowId, Arc<WorkflowSnapshot>>>,
    pending: Mutex<VecDeque<PendingUpdate>>,
    indices: RwLock<SecondaryIndices>,
    /// Highest sequence written per workflow.
    newest: DashMap<WorkflowId, u64>,
    source: Arc<dyn SnapshotSource>,
    counters: Counters,
    pending_signal: Notify,
}

impl TieredCache {
    pub fn new(
        hot_capacity: NonZeroUsize,
        warm_capacity: NonZeroUsize,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            hot: Mutex::new(LruCache::new(hot_capacity)),
            warm: Mutex::new(LruCache::new(warm_capacity)),
            pending: Mutex::new(VecDeque::new()),
            indices: RwLock::new(SecondaryIndices::default()),
            newest: DashMap::new(),
            source,
            counters: Counters::default(),
            pending_signal: Notify::new(),
        }
    }

    /// Writes a snapshot. The hot tier is updated before this returns.
    ///
    /// A write older than the newest one seen for the workflow is dropped.
    pub fn put(&self, snapshot: Arc<WorkflowSnapshot>) {
        if self.put_hot(snapshot.clone()) {
            self.pending.lock().push_back(PendingUpdate::Write(snapshot));
            self.pending_signal.notify_one();
        }
    }

    fn put_hot(&self, snapshot: Arc<WorkflowSnapshot>) -> bool {
        let id = snapshot.workflow_id.clone();
        {
            let mut newest = self.newest.entry(id.clone()).or_insert(0);
            if *newest > snapshot.sequence {
                return false;
            }
            *newest = snapshot.sequence;
        }

        let evicted = self.hot.lock().push(id.clone(), snapshot);
        if let Some((evicted_id, evicted)) = evicted {
            if evicted_id != id {
                self.pending.lock().push_back(PendingUpdate::Demote(evicted));
                self.pending_signal.notify_one();
            }
        }
        true
    }

    /// Reads through the tiers, rebuilding from the source on a full miss.
    pub async fn get(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<Arc<WorkflowSnapshot>>, WorkflowError> {
        if let Some(snapshot) = self.hot.lock().get(workflow_id).cloned() {
            self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(snapshot));
        }

        if let Some(snapshot) = self.take_warm(workflow_id) {
            self.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
            self.put_hot(snapshot.clone());
            return Ok(Some(snapshot));
        }

        match self.source.rebuild(workflow_id).await? {
            Some(snapshot) => {
                self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(workflow_id = %workflow_id, sequence = snapshot.sequence, "Rebuilt snapshot from event log");
                let snapshot = Arc::new(snapshot);
                self.put(snapshot.clone());
                Ok(Some(snapshot))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Cached snapshot without rebuilding or touching recency.
    pub fn peek(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowSnapshot>> {
        if let Some(snapshot) = self.hot.lock().peek(workflow_id).cloned() {
            return Some(snapshot);
        }
        self.drain_pending();
        self.warm.lock().peek(workflow_id).cloned()
    }

    fn take_warm(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowSnapshot>> {
        self.drain_pending();
        self.warm.lock().pop(workflow_id)
    }

    /// Applies every queued warm/index update. Returns how many were applied.
    pub fn drain_pending(&self) -> usize {
        let updates: Vec<PendingUpdate> = self.pending.lock().drain(..).collect();
        let count = updates.len();
        for update in updates {
            match update {
                PendingUpdate::Write(snapshot) => {
                    self.indices.write().record(&snapshot);
                    self.put_warm_if_newer(snapshot);
                }
                PendingUpdate::Demote(snapshot) => self.put_warm_if_newer(snapshot),
            }
        }
        count
    }

    fn put_warm_if_newer(&self, snapshot: Arc<WorkflowSnapshot>) {
        let mut warm = self.warm.lock();
        let stale = warm
            .peek(&snapshot.workflow_id)
            .is_some_and(|current| current.sequence > snapshot.sequence);
        if !stale {
            warm.push(snapshot.workflow_id.clone(), snapshot);
        }
    }

    /// Resolves once at least one update is queued.
    pub async fn pending_updates(&self) {
        self.pending_signal.notified().await;
    }

    pub fn workflows_with_status(&self, status: WorkflowStatus) -> Vec<WorkflowId> {
        self.drain_pending();
        self.indices.read().with_status(status)
    }

    pub fn workflows_for_agent(&self, agent_id: &AgentId) -> Vec<WorkflowId> {
        self.drain_pending();
        self.indices.read().for_agent(agent_id)
    }

    /// Most recently updated workflows, newest first.
    pub fn most_recent(&self, limit: usize) -> Vec<WorkflowId> {
        self.drain_pending();
        self.indices.read().most_recent(limit)
    }

    /// Last indexed status, even for workflows no longer resident.
    pub fn indexed_status(&self, workflow_id: &WorkflowId) -> Option<WorkflowStatus> {
        self.drain_pending();
        self.indices.read().status_of(workflow_id)
    }

    /// Whether the workflow sits in the hot or warm tier.
    pub fn is_resident(&self, workflow_id: &WorkflowId) -> bool {
        if self.hot.lock().contains(workflow_id) {
            return true;
        }
        self.drain_pending();
        self.warm.lock().contains(workflow_id)
    }

    /// Drops the workflow from both tiers. Indices are kept.
    pub fn invalidate(&self, workflow_id: &WorkflowId) {
        self.drain_pending();
        self.hot.lock().pop(workflow_id);
        self.warm.lock().pop(workflow_id);
    }

    /// Drops the workflow from the tiers and the indices.
    pub fn forget(&self, workflow_id: &WorkflowId) {
        self.invalidate(workflow_id);
        self.indices.write().remove(workflow_id);
        self.newest.remove(workflow_id);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hot_hits: self.counters.hot_hits.load(Ordering::Relaxed),
            warm_hits: self.counters.warm_hits.load(Ordering::Relaxed),
            rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    pub fn hot_len(&self) -> usize {
        self.hot.lock().len()
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
