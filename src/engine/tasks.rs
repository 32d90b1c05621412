//! Background loops owned by the engine.
//!
//! Each loop ticks on its own interval and stops when the engine's shutdown
//! watch flips.

use super::orchestration::{Pass, Work};
use super::WorkflowEngine;
use crate::consistency::ConsistencyEvent;
use crate::domain::cqrs::WorkflowCommand;
use crate::domain::errors::WorkflowError;
use crate::domain::failure::{FailureKind, FailureSignal};
use crate::domain::supervisor::SupervisorMsg;
use crate::domain::types::{StepId, WorkflowId, WorkflowStatus};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub(super) fn spawn_all(engine: &WorkflowEngine) -> Vec<JoinHandle<()>> {
    let config = engine.config().clone();
    let mut handles = Vec::new();

    if config.conflict.scan_interval_ms > 0 {
        handles.push(spawn_periodic(
            engine,
            "conflict scan",
            config.conflict.scan_interval_ms,
            |engine| async move {
                let outcomes = engine.scan_conflicts().await;
                if !outcomes.is_empty() {
                    tracing::debug!(conflicts = outcomes.len(), "Conflict scan finished");
                }
            },
        ));
    }

    handles.push(spawn_periodic(
        engine,
        "cache maintenance",
        config.cache.maintenance_interval_ms,
        |engine| async move {
            let retired = engine.maintain().await;
            if retired > 0 {
                tracing::debug!(retired, "Retired idle workflow actors");
            }
        },
    ));

    handles.push(spawn_periodic(
        engine,
        "watchdog",
        config.engine.watchdog_interval_ms,
        |engine| async move { engine.run_watchdog().await },
    ));

    if let Some(manager) = engine.inner.consistency.clone() {
        let (events_tx, events_rx) = mpsc::channel(config.consistency.queue_capacity.max(1));
        handles.push(manager.spawn_worker(events_tx, engine.inner.shutdown_tx.subscribe()));
        handles.push(spawn_adoption(engine.clone(), events_rx));
    }

    handles
}

fn spawn_periodic<F, Fut>(engine: &WorkflowEngine, name: &'static str, interval_ms: u64, tick: F) -> JoinHandle<()>
where
    F: Fn(WorkflowEngine) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let engine = engine.clone();
    let mut shutdown = engine.inner.shutdown_tx.subscribe();
    let period = Duration::from_millis(interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(engine.clone()).await,
                _ = shutdown.changed() => {
                    tracing::info!(task = name, "Background task stopping due to shutdown");
                    break;
                }
            }
        }
    })
}

/// Applies what the consistency worker reconciled in the background.
fn spawn_adoption(engine: WorkflowEngine, mut events: mpsc::Receiver<ConsistencyEvent>) -> JoinHandle<()> {
    let mut shutdown = engine.inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => engine.on_consistency_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    tracing::info!("Replica adoption stopping due to shutdown");
                    break;
                }
            }
        }
    })
}

impl WorkflowEngine {
    /// Stalled barriers, workflow timeouts and deferred starts.
    pub async fn run_watchdog(&self) {
        if self.is_stopped() {
            return;
        }
        let mut pass = Pass::new();

        let stall = Duration::from_millis(self.inner.config.coordination.stall_timeout_ms);
        for stalled in self.inner.coordinator.stalled(stall) {
            let timeout = WorkflowError::CoordinationTimeout {
                point: stalled.point_id.clone(),
            };
            tracing::warn!(
                workflow_id = %stalled.workflow_id,
                point_id = %stalled.point_id,
                arrived = stalled.arrived.len(),
                required = stalled.required,
                "Synchronization point stalled"
            );
            let mut signal = FailureSignal::new(
                stalled.workflow_id.clone(),
                FailureKind::CoordinationTimeout,
                format!("{timeout}: {} of {} agents arrived", stalled.arrived.len(), stalled.required),
            );
            let prefix = format!("{}/", stalled.workflow_id);
            if let Some(step) = stalled.point_id.strip_prefix(&prefix) {
                signal = signal.for_step(StepId::from(step));
            }
            pass.push(Work::Recover(signal));
        }

        let now = self.inner.services.clock.now();
        for workflow_id in self.inner.cache.workflows_with_status(WorkflowStatus::Active) {
            let Some(snapshot) = self.current(&workflow_id).await else {
                continue;
            };
            if let (Some(timeout_ms), Some(activated_at)) =
                (snapshot.definition.timeout_ms, snapshot.activated_at)
            {
                if now.millis_since(&activated_at) > timeout_ms {
                    tracing::warn!(workflow_id = %workflow_id, timeout_ms, "Workflow timed out");
                    pass.push(Work::Command {
                        workflow_id: workflow_id.clone(),
                        command: WorkflowCommand::Fail {
                            reason: format!("timed out after {timeout_ms} ms"),
                        },
                        cause: None,
                    });
                    pass.push(Work::Recover(FailureSignal::new(
                        workflow_id,
                        FailureKind::Timeout,
                        format!("workflow exceeded its {timeout_ms} ms timeout"),
                    )));
                    continue;
                }
            }
            pass.push(Work::Advance(workflow_id));
        }

        let deferred: Vec<WorkflowId> = self
            .inner
            .deferred
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for workflow_id in deferred {
            pass.push(Work::Activate(workflow_id));
        }

        self.run(&mut pass).await;
    }

    /// Applies queued cache writes, then retires actors of terminal
    /// workflows that fell out of the hot tier. Returns how many retired.
    pub async fn maintain(&self) -> usize {
        let drained = self.inner.cache.drain_pending();
        if drained > 0 {
            tracing::trace!(drained, "Applied pending cache updates");
        }

        let candidates: Vec<WorkflowId> = self.inner.live.iter().map(|id| id.key().clone()).collect();
        let mut retired = 0;
        for workflow_id in candidates {
            let terminal = self
                .inner
                .cache
                .indexed_status(&workflow_id)
                .is_some_and(|status| status.is_terminal());
            if !terminal || self.inner.cache.is_resident(&workflow_id) {
                continue;
            }
            if self.retire(&workflow_id).await {
                retired += 1;
            }
        }
        retired
    }

    async fn retire(&self, workflow_id: &WorkflowId) -> bool {
        let (tx, rx) = oneshot::channel();
        let retired = match self
            .inner
            .supervisor
            .send_message(SupervisorMsg::Retire(workflow_id.clone(), tx))
        {
            Ok(()) => rx.await.unwrap_or(false),
            Err(_) => false,
        };
        self.inner.live.remove(workflow_id);
        self.inner.deferred.remove(workflow_id);
        self.inner.coordinator.close_workflow(workflow_id);
        self.inner.recovery.checkpoints().evict(workflow_id);
        self.inner.cache.forget(workflow_id);
        if let Some(manager) = &self.inner.consistency {
            manager.forget(workflow_id);
        }
        tracing::debug!(workflow_id = %workflow_id, retired, "Workflow actor retired");
        retired
    }

    /// Stops background tasks and every workflow actor.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Background task ended abnormally");
            }
        }

        let live: Vec<WorkflowId> = self.inner.live.iter().map(|id| id.key().clone()).collect();
        for workflow_id in &live {
            self.retire(workflow_id).await;
        }

        self.inner.supervisor.stop(Some("engine shutdown".to_string()));
        let handle = self.inner.supervisor_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(retired = live.len(), "Workflow engine stopped");
    }
}
