use super::*;
use crate::domain::types::TimestampUtc;
use crate::domain::WorkflowEvent;
use crate::test_support::sequential_definition;
use proptest::prelude::*;
use std::collections::HashMap;

/// Source backed by a plain map, counting rebuilds.
#[derive(Default)]
struct MapSource {
    snapshots: Mutex<HashMap<WorkflowId, WorkflowSnapshot>>,
    calls: AtomicU64,
}

impl MapSource {
    fn with(snapshots: Vec<WorkflowSnapshot>) -> Arc<Self> {
        let source = Self::default();
        for snapshot in snapshots {
            source
                .snapshots
                .lock()
                .insert(snapshot.workflow_id.clone(), snapshot);
        }
        Arc::new(source)
    }
}

#[async_trait]
impl SnapshotSource for MapSource {
    async fn rebuild(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowSnapshot>, WorkflowError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.snapshots.lock().get(workflow_id).cloned())
    }
}

fn size(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).expect("non-zero")
}

fn snapshot(id: &str) -> WorkflowSnapshot {
    WorkflowSnapshot::created(sequential_definition(id), TimestampUtc::now())
}

fn activated(id: &str) -> WorkflowSnapshot {
    let mut snapshot = snapshot(id);
    snapshot.apply(&WorkflowEvent::WorkflowActivated {
        activated_at: TimestampUtc::now(),
    });
    snapshot
}

#[tokio::test]
async fn test_miss_rebuilds_then_hits_hot() {
    let source = MapSource::with(vec![snapshot("w1")]);
    let cache = TieredCache::new(size(2), size(4), source.clone());
    let id = WorkflowId::from("w1");

    assert!(cache.get(&id).await.unwrap().is_some());
    assert!(cache.get(&id).await.unwrap().is_some());
    assert!(cache.get(&WorkflowId::from("nope")).await.unwrap().is_none());

    assert_eq!(
        cache.stats(),
        CacheStats {
            hot_hits: 1,
            warm_hits: 0,
            rebuilds: 1,
            misses: 1,
        }
    );
    assert_eq!(source.calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_hot_eviction_demotes_to_warm() {
    let cache = TieredCache::new(size(1), size(4), MapSource::with(Vec::new()));
    cache.put(Arc::new(snapshot("w1")));
    cache.put(Arc::new(snapshot("w2")));
    assert_eq!(cache.hot_len(), 1);

    let w1 = cache.get(&WorkflowId::from("w1")).await.unwrap();
    assert!(w1.is_some());
    assert_eq!(cache.stats().warm_hits, 1);
    assert_eq!(cache.stats().rebuilds, 0);
    assert!(cache.is_resident(&WorkflowId::from("w2")));
}

#[tokio::test]
async fn test_older_snapshot_never_replaces_newer() {
    let cache = TieredCache::new(size(2), size(4), MapSource::with(Vec::new()));
    let id = WorkflowId::from("w1");
    cache.put(Arc::new(activated("w1")));
    cache.put(Arc::new(snapshot("w1")));

    assert_eq!(cache.peek(&id).expect("cached").sequence, 2);
    cache.drain_pending();
    assert_eq!(
        cache.indexed_status(&id),
        Some(crate::domain::types::WorkflowStatus::Active)
    );
}

#[test]
fn test_indices_follow_latest_write() {
    let cache = TieredCache::new(size(2), size(4), MapSource::with(Vec::new()));
    cache.put(Arc::new(snapshot("w1")));
    cache.put(Arc::new(snapshot("w2")));
    assert_eq!(
        cache.workflows_with_status(WorkflowStatus::Pending),
        vec![WorkflowId::from("w1"), WorkflowId::from("w2")]
    );

    let mut running = activated("w1");
    running.assigned_agents.insert(
        crate::domain::types::StepId::from("s1"),
        AgentId::from("arm-3"),
    );
    cache.put(Arc::new(running));

    assert_eq!(
        cache.workflows_with_status(WorkflowStatus::Pending),
        vec![WorkflowId::from("w2")]
    );
    assert_eq!(
        cache.workflows_for_agent(&AgentId::from("arm-3")),
        vec![WorkflowId::from("w1")]
    );
    assert_eq!(cache.most_recent(1), vec![WorkflowId::from("w1")]);
}

#[test]
fn test_forget_drops_tiers_and_indices() {
    let cache = TieredCache::new(size(2), size(4), MapSource::with(Vec::new()));
    let id = WorkflowId::from("w1");
    cache.put(Arc::new(snapshot("w1")));

    cache.invalidate(&id);
    assert!(!cache.is_resident(&id));
    assert_eq!(cache.indexed_status(&id), Some(WorkflowStatus::Pending));

    cache.forget(&id);
    assert_eq!(cache.indexed_status(&id), None);
}

#[tokio::test]
async fn test_pending_updates_wakes_maintenance() {
    let cache = Arc::new(TieredCache::new(
        size(2),
        size(4),
        MapSource::with(Vec::new()),
    ));
    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache.pending_updates().await;
            cache.drain_pending()
        })
    };
    tokio::task::yield_now().await;
    cache.put(Arc::new(snapshot("w1")));
    let drained = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
        .await
        .expect("woken")
        .expect("join");
    assert!(drained <= 1);
    assert_eq!(cache.indexed_status(&WorkflowId::from("w1")), Some(WorkflowStatus::Pending));
}

proptest! {
    #[test]
    fn prop_cache_matches_latest_write(writes in prop::collection::vec((0usize..5, 1u64..50), 1..60)) {
        let cache = TieredCache::new(size(2), size(3), MapSource::with(Vec::new()));
        let mut latest: HashMap<WorkflowId, u64> = HashMap::new();
        for (workflow, sequence) in writes {
            let id = format!("w{workflow}");
            let mut snap = snapshot(&id);
            snap.sequence = sequence;
            cache.put(Arc::new(snap));
            let entry = latest.entry(WorkflowId::from(id.as_str())).or_insert(0);
            *entry = (*entry).max(sequence);
        }
        for (id, sequence) in latest {
            if let Some(cached) = cache.peek(&id) {
                prop_assert_eq!(cached.sequence, sequence);
            }
        }
    }
}
