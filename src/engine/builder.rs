//! Assembles a [`WorkflowEngine`] from its collaborators.

use super::handlers::{EventHandler, HandlerRegistry};
use super::ports::{
    AgentSelector, AlwaysAvailable, ExecutionAdapter, LifecycleSink, LoggingAdapter,
    ResourceAvailability, TracingSink,
};
use super::{tasks, EngineInner, WorkflowEngine};
use crate::cache::TieredCache;
use crate::config::EngineConfig;
use crate::conflict::{ConflictDetector, ConflictResolver};
use crate::consistency::{ConsistencyManager, EdgeCloudTransport};
use crate::coordination::MultiAgentCoordinator;
use crate::dependency::DependencyGraph;
use crate::domain::cqrs::EventKind;
use crate::domain::errors::{StorageError, WorkflowError};
use crate::domain::services::WorkflowServices;
use crate::domain::supervisor::WorkflowSupervisor;
use crate::event_store::{InMemoryBackend, StorageBackend, WorkflowEventStore};
use crate::recovery::RecoveryManager;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use ractor::Actor;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    services: WorkflowServices,
    backend: Option<Arc<dyn StorageBackend>>,
    selector: Arc<dyn AgentSelector>,
    adapter: Arc<dyn ExecutionAdapter>,
    resources: Arc<dyn ResourceAvailability>,
    transport: Option<Arc<dyn EdgeCloudTransport>>,
    sink: Arc<dyn LifecycleSink>,
    handlers: Vec<(EventKind, Arc<dyn EventHandler>)>,
    background: bool,
}

impl WorkflowEngineBuilder {
    pub(super) fn new(selector: Arc<dyn AgentSelector>) -> Self {
        Self {
            config: EngineConfig::default(),
            services: WorkflowServices::default(),
            backend: None,
            selector,
            adapter: Arc::new(LoggingAdapter),
            resources: Arc::new(AlwaysAvailable),
            transport: None,
            sink: Arc::new(TracingSink),
            handlers: Vec::new(),
            background: true,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn services(mut self, services: WorkflowServices) -> Self {
        self.services = services;
        self
    }

    /// Defaults to an in-memory backend.
    pub fn storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceAvailability>) -> Self {
        self.resources = resources;
        self
    }

    /// Enables edge/cloud reconciliation.
    pub fn transport(mut self, transport: Arc<dyn EdgeCloudTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn lifecycle_sink(mut self, sink: Arc<dyn LifecycleSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Registers `handler` for `kind`, after the lifecycle handler.
    pub fn handler(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Periodic conflict scans, maintenance and the watchdog. On by default.
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    pub async fn start(self) -> Result<WorkflowEngine, WorkflowError> {
        let WorkflowEngineBuilder {
            config,
            services,
            backend,
            selector,
            adapter,
            resources,
            transport,
            sink,
            handlers: extra_handlers,
            background,
        } = self;

        config
            .validate()
            .map_err(|err| WorkflowError::validation(format!("{err:#}")))?;

        let backend = backend.unwrap_or_else(|| Arc::new(InMemoryBackend::new()));
        let store = WorkflowEventStore::new(backend.clone(), config.event_store.snapshot_every);
        let capacity = |size: usize| {
            NonZeroUsize::new(size)
                .ok_or_else(|| WorkflowError::validation("cache capacities must be positive"))
        };
        let cache = Arc::new(TieredCache::new(
            capacity(config.cache.hot_capacity)?,
            capacity(config.cache.warm_capacity)?,
            Arc::new(store.clone()),
        ));

        let (supervisor, supervisor_handle) = Actor::spawn(None, WorkflowSupervisor, ())
            .await
            .map_err(|err| StorageError::Io {
                message: format!("failed to start workflow supervisor: {err}"),
            })?;

        let (event_tx, _) = broadcast::channel(config.engine.event_channel_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let mut handlers = HandlerRegistry::lifecycle(sink);
        for (kind, handler) in extra_handlers {
            handlers.register(kind, handler);
        }

        let consistency = transport
            .map(|transport| Arc::new(ConsistencyManager::new(config.consistency.clone(), transport)));

        let inner = EngineInner {
            graph: DependencyGraph::new(),
            coordinator: MultiAgentCoordinator::new(config.coordination.default_protocol),
            detector: ConflictDetector::new(config.conflict.clone()),
            resolver: ConflictResolver::new(&config.conflict),
            recovery: RecoveryManager::new(config.recovery.clone(), backend),
            consistency,
            store,
            cache,
            supervisor,
            supervisor_handle: Mutex::new(Some(supervisor_handle)),
            selector,
            adapter,
            resources,
            handlers,
            event_tx,
            services,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            live: DashSet::new(),
            deferred: DashMap::new(),
            config,
        };
        let engine = WorkflowEngine {
            inner: Arc::new(inner),
        };

        if background {
            let handles = tasks::spawn_all(&engine);
            engine.inner.tasks.lock().extend(handles);
        }

        let consistency = engine
            .inner
            .consistency
            .as_ref()
            .map_or_else(|| "disabled".to_string(), |manager| manager.level().to_string());
        tracing::info!(
            consistency = %consistency,
            handlers = engine.inner.handlers.len(),
            background,
            "Workflow engine started"
        );
        Ok(engine)
    }
}
