//! Multi-agent synchronization barriers.
//!
//! A [`SynchronizationPoint`] releases every waiting participant once the
//! number of distinct arrived agents reaches its required count, then resets
//! for the next phase. Waiting is a registered continuation, not a blocked
//! thread. The coordinator never times out on its own: the engine's
//! watchdog polls [`MultiAgentCoordinator::stalled`] and raises failure
//! signals for stuck barriers.

mod protocol;

pub use protocol::{CoordinationProtocol, ProceedDirective, ProceedRole};

use crate::domain::errors::WorkflowError;
use crate::domain::types::{AgentId, TimestampUtc, WorkflowId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// Everything a participant learns when a barrier releases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarrierRelease {
    pub point_id: String,
    pub workflow_id: WorkflowId,
    /// Phase that just completed, starting at 1.
    pub phase: u64,
    pub protocol: CoordinationProtocol,
    /// Arrived agents, in arrival order.
    pub participants: Vec<AgentId>,
    pub directives: Vec<ProceedDirective>,
    pub released_at: TimestampUtc,
}

impl BarrierRelease {
    pub fn directive_for(&self, agent_id: &AgentId) -> Option<&ProceedDirective> {
        self.directives
            .iter()
            .find(|directive| &directive.agent_id == agent_id)
    }
}

/// Continuation resolved when the barrier releases.
#[derive(Debug)]
pub struct BarrierWait {
    point_id: String,
    receiver: oneshot::Receiver<BarrierRelease>,
}

impl BarrierWait {
    pub fn point_id(&self) -> &str {
        &self.point_id
    }

    /// Waits for the release. Fails if the point is closed first.
    pub async fn wait(self) -> Result<BarrierRelease, WorkflowError> {
        self.receiver.await.map_err(|_| {
            WorkflowError::validation(format!(
                "synchronization point {} was closed before release",
                self.point_id
            ))
        })
    }
}

/// Result of one arrival.
#[derive(Debug)]
pub enum Arrival {
    /// This arrival completed the barrier.
    Released(BarrierRelease),
    /// Still waiting on other agents.
    Waiting(BarrierWait),
}

impl Arrival {
    pub fn is_released(&self) -> bool {
        matches!(self, Arrival::Released(_))
    }
}

/// Read-only view of a point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynchronizationPoint {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub required: usize,
    /// Agents arrived in the current phase, in arrival order.
    pub arrived: Vec<AgentId>,
    /// Number of completed phases.
    pub releases: u64,
    pub opened_at: TimestampUtc,
    /// First arrival of the current phase.
    pub waiting_since: Option<TimestampUtc>,
}

/// A barrier the watchdog should report.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledPoint {
    pub point_id: String,
    pub workflow_id: WorkflowId,
    pub arrived: Vec<AgentId>,
    pub required: usize,
    pub waiting_since: TimestampUtc,
}

struct PointState {
    workflow_id: WorkflowId,
    required: usize,
    arrived: Vec<AgentId>,
    bids: HashMap<AgentId, f64>,
    waiters: Vec<oneshot::Sender<BarrierRelease>>,
    releases: u64,
    opened_at: TimestampUtc,
    waiting_since: Option<TimestampUtc>,
    stall_reported: bool,
}

impl PointState {
    fn view(&self, id: &str) -> SynchronizationPoint {
        SynchronizationPoint {
            id: id.to_string(),
            workflow_id: self.workflow_id.clone(),
            required: self.required,
            arrived: self.arrived.clone(),
            releases: self.releases,
            opened_at: self.opened_at,
            waiting_since: self.waiting_since,
        }
    }
}

/// Owns every open synchronization point and the per-workflow protocols.
pub struct MultiAgentCoordinator {
    points: Mutex<HashMap<String, PointState>>,
    protocols: DashMap<WorkflowId, CoordinationProtocol>,
    default_protocol: CoordinationProtocol,
}

impl Default for MultiAgentCoordinator {
    fn default() -> Self {
        Self::new(CoordinationProtocol::default())
    }
}

impl MultiAgentCoordinator {
    pub fn new(default_protocol: CoordinationProtocol) -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
            protocols: DashMap::new(),
            default_protocol,
        }
    }

    /// Selects the protocol used for the workflow's future releases.
    pub fn configure_workflow(&self, workflow_id: &WorkflowId, protocol: CoordinationProtocol) {
        self.protocols.insert(workflow_id.clone(), protocol);
    }

    pub fn protocol_for(&self, workflow_id: &WorkflowId) -> CoordinationProtocol {
        self.protocols
            .get(workflow_id)
            .map_or(self.default_protocol, |protocol| *protocol)
    }

    /// Opens a point. Re-opening with the same required count is a no-op.
    pub fn open_point(
        &self,
        workflow_id: &WorkflowId,
        point_id: impl Into<String>,
        required: usize,
    ) -> Result<(), WorkflowError> {
        let point_id = point_id.into();
        if required == 0 {
            return Err(WorkflowError::validation(format!(
                "synchronization point {point_id} needs at least one agent"
            )));
        }

        let mut points = self.points.lock();
        if let Some(existing) = points.get(&point_id) {
            if existing.workflow_id == *workflow_id && existing.required == required {
                return Ok(());
            }
            return Err(WorkflowError::validation(format!(
                "synchronization point {point_id} is already open with different settings"
            )));
        }

        points.insert(
            point_id.clone(),
            PointState {
                workflow_id: workflow_id.clone(),
                required,
                arrived: Vec::new(),
                bids: HashMap::new(),
                waiters: Vec::new(),
                releases: 0,
                opened_at: TimestampUtc::now(),
                waiting_since: None,
                stall_reported: false,
            },
        );
        tracing::debug!(workflow_id = %workflow_id, point_id = %point_id, required, "Synchronization point opened");
        Ok(())
    }

    /// Removes a point. Pending waiters observe the closure as an error.
    pub fn close_point(&self, point_id: &str) -> bool {
        self.points.lock().remove(point_id).is_some()
    }

    /// Closes every point of a workflow. Returns how many were closed.
    pub fn close_workflow(&self, workflow_id: &WorkflowId) -> usize {
        let mut points = self.points.lock();
        let before = points.len();
        points.retain(|_, state| state.workflow_id != *workflow_id);
        self.protocols.remove(workflow_id);
        before - points.len()
    }

    /// Records an arrival. Re-arrival in the same phase never double-counts.
    pub fn arrive(&self, point_id: &str, agent_id: &AgentId) -> Result<Arrival, WorkflowError> {
        self.arrive_inner(point_id, agent_id, None)
    }

    /// Arrival carrying a bid for auction-based release.
    pub fn arrive_with_bid(
        &self,
        point_id: &str,
        agent_id: &AgentId,
        bid: f64,
    ) -> Result<Arrival, WorkflowError> {
        if !bid.is_finite() {
            return Err(WorkflowError::validation(format!(
                "bid from {agent_id} must be a finite number"
            )));
        }
        self.arrive_inner(point_id, agent_id, Some(bid))
    }

    fn arrive_inner(
        &self,
        point_id: &str,
        agent_id: &AgentId,
        bid: Option<f64>,
    ) -> Result<Arrival, WorkflowError> {
        let mut points = self.points.lock();
        let state = points.get_mut(point_id).ok_or_else(|| {
            WorkflowError::validation(format!("unknown synchronization point {point_id}"))
        })?;

        if !state.arrived.contains(agent_id) {
            state.arrived.push(agent_id.clone());
        }
        if let Some(bid) = bid {
            state.bids.insert(agent_id.clone(), bid);
        }
        if state.waiting_since.is_none() {
            state.waiting_since = Some(TimestampUtc::now());
        }

        if state.arrived.len() < state.required {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            tracing::debug!(
                point_id,
                agent_id = %agent_id,
                arrived = state.arrived.len(),
                required = state.required,
                "Agent waiting at barrier"
            );
            return Ok(Arrival::Waiting(BarrierWait {
                point_id: point_id.to_string(),
                receiver: rx,
            }));
        }

        let protocol = self.protocol_for(&state.workflow_id);
        let participants = std::mem::take(&mut state.arrived);
        let bids = std::mem::take(&mut state.bids);
        state.releases += 1;
        state.waiting_since = None;
        state.stall_reported = false;

        let release = BarrierRelease {
            point_id: point_id.to_string(),
            workflow_id: state.workflow_id.clone(),
            phase: state.releases,
            protocol,
            directives: protocol.directives(&participants, &bids),
            participants,
            released_at: TimestampUtc::now(),
        };
        for waiter in state.waiters.drain(..) {
            // A dropped wait handle just misses the release.
            let _ = waiter.send(release.clone());
        }
        tracing::info!(
            point_id,
            workflow_id = %release.workflow_id,
            phase = release.phase,
            protocol = %protocol,
            "Barrier released"
        );
        Ok(Arrival::Released(release))
    }

    pub fn point(&self, point_id: &str) -> Option<SynchronizationPoint> {
        self.points
            .lock()
            .get(point_id)
            .map(|state| state.view(point_id))
    }

    pub fn points_for(&self, workflow_id: &WorkflowId) -> Vec<SynchronizationPoint> {
        let mut points: Vec<SynchronizationPoint> = self
            .points
            .lock()
            .iter()
            .filter(|(_, state)| state.workflow_id == *workflow_id)
            .map(|(id, state)| state.view(id))
            .collect();
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }

    /// Points whose current phase has waited longer than `older_than`.
    ///
    /// Each stall is reported once; the point becomes reportable again
    /// after its next release.
    pub fn stalled(&self, older_than: Duration) -> Vec<StalledPoint> {
        let threshold = u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX);
        let now = TimestampUtc::now();
        let mut stalled = Vec::new();
        for (id, state) in self.points.lock().iter_mut() {
            let Some(since) = state.waiting_since else {
                continue;
            };
            if state.stall_reported || now.millis_since(&since) < threshold {
                continue;
            }
            state.stall_reported = true;
            stalled.push(StalledPoint {
                point_id: id.clone(),
                workflow_id: state.workflow_id.clone(),
                arrived: state.arrived.clone(),
                required: state.required,
                waiting_since: since,
            });
        }
        stalled.sort_by(|a, b| a.point_id.cmp(&b.point_id));
        stalled
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
