//! Secondary indices over cached snapshots: status, assigned agent, recency.

use crate::domain::snapshot::WorkflowSnapshot;
use crate::domain::types::{AgentId, TimestampUtc, WorkflowId, WorkflowStatus};
use std::collections::{BTreeSet, HashMap};

struct IndexEntry {
    sequence: u64,
    status: WorkflowStatus,
    agents: BTreeSet<AgentId>,
    updated_at: TimestampUtc,
}

#[derive(Default)]
pub struct SecondaryIndices {
    entries: HashMap<WorkflowId, IndexEntry>,
    by_status: HashMap<WorkflowStatus, BTreeSet<WorkflowId>>,
    by_agent: HashMap<AgentId, BTreeSet<WorkflowId>>,
    by_recency: BTreeSet<(TimestampUtc, WorkflowId)>,
}

impl SecondaryIndices {
    /// Indexes `snapshot` unless a newer one is already indexed.
    pub fn record(&mut self, snapshot: &WorkflowSnapshot) {
        let id = &snapshot.workflow_id;
        if self
            .entries
            .get(id)
            .is_some_and(|entry| entry.sequence > snapshot.sequence)
        {
            return;
        }
        self.remove(id);

        let entry = IndexEntry {
            sequence: snapshot.sequence,
            status: snapshot.status(),
            agents: snapshot.assigned_agents.values().cloned().collect(),
            updated_at: snapshot.updated_at,
        };
        self.by_status
            .entry(entry.status)
            .or_default()
            .insert(id.clone());
        for agent in &entry.agents {
            self.by_agent
                .entry(agent.clone())
                .or_default()
                .insert(id.clone());
        }
        self.by_recency.insert((entry.updated_at, id.clone()));
        self.entries.insert(id.clone(), entry);
    }

    pub fn remove(&mut self, id: &WorkflowId) {
        let Some(entry) = self.entries.remove(id) else {
            return;
        };
        if let Some(ids) = self.by_status.get_mut(&entry.status) {
            ids.remove(id);
        }
        for agent in &entry.agents {
            if let Some(ids) = self.by_agent.get_mut(agent) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_agent.remove(agent);
                }
            }
        }
        self.by_recency.remove(&(entry.updated_at, id.clone()));
    }

    pub fn with_status(&self, status: WorkflowStatus) -> Vec<WorkflowId> {
        self.by_status
            .get(&status)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn for_agent(&self, agent: &AgentId) -> Vec<WorkflowId> {
        self.by_agent
            .get(agent)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn most_recent(&self, limit: usize) -> Vec<WorkflowId> {
        self.by_recency
            .iter()
            .rev()
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn status_of(&self, id: &WorkflowId) -> Option<WorkflowStatus> {
        self.entries.get(id).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
