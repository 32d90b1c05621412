//! Inter-workflow dependency graph.
//!
//! Workflow nodes live in a `StableDiGraph` arena indexed by workflow id, so
//! removing a workflow never invalidates the indices of the others. Edge
//! insertion and its cycle check happen under one write lock: a rejected
//! edge leaves no trace.

use crate::domain::condition::Condition;
use crate::domain::errors::WorkflowError;
use crate::domain::snapshot::OUTPUTS_KEY;
use crate::domain::types::{WorkflowId, WorkflowStatus};
use parking_lot::RwLock;
use petgraph::stable_graph::{EdgeReference, NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Target waits for the source to complete successfully.
    Sequential,
    /// Ordering only; always satisfied.
    Parallel,
    /// Satisfied when the condition holds on the source's global context.
    Conditional,
    /// Satisfied when every named resource is available.
    ResourceBased,
    /// Satisfied once the source has published the named outputs.
    DataFlow,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DependencyType::Sequential => "sequential",
            DependencyType::Parallel => "parallel",
            DependencyType::Conditional => "conditional",
            DependencyType::ResourceBased => "resource_based",
            DependencyType::DataFlow => "data_flow",
        };
        f.write_str(name)
    }
}

/// Type-specific data an edge is evaluated with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyConditions {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub resources: Vec<String>,
    /// Output keys (step ids) the source must have published.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A directed edge `source -> target`: `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDependency {
    pub source: WorkflowId,
    pub target: WorkflowId,
    pub dependency_type: DependencyType,
    #[serde(default)]
    pub conditions: DependencyConditions,
}

impl WorkflowDependency {
    pub fn new(
        source: impl Into<WorkflowId>,
        target: impl Into<WorkflowId>,
        dependency_type: DependencyType,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            dependency_type,
            conditions: DependencyConditions::default(),
        }
    }

    pub fn with_conditions(mut self, conditions: DependencyConditions) -> Self {
        self.conditions = conditions;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DependencyEdge {
    dependency_type: DependencyType,
    conditions: DependencyConditions,
}

/// What edge predicates need to know about the rest of the system.
pub trait DependencyContext {
    fn status(&self, workflow_id: &WorkflowId) -> Option<WorkflowStatus>;
    fn global_context(&self, workflow_id: &WorkflowId) -> Option<&Map<String, Value>>;
    fn resource_available(&self, resource: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmetDependency {
    pub source: WorkflowId,
    pub dependency_type: DependencyType,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyResolution {
    pub workflow_id: WorkflowId,
    pub unmet: Vec<UnmetDependency>,
}

impl DependencyResolution {
    pub fn is_satisfied(&self) -> bool {
        self.unmet.is_empty()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.unmet
            .iter()
            .map(|unmet| {
                format!(
                    "{} ({}): {}",
                    unmet.source, unmet.dependency_type, unmet.reason
                )
            })
            .collect()
    }
}

#[derive(Default)]
struct GraphInner {
    graph: StableDiGraph<WorkflowId, DependencyEdge>,
    nodes: HashMap<WorkflowId, NodeIndex>,
}

impl GraphInner {
    /// Returns the node and whether it was created by this call.
    fn ensure_node(&mut self, id: &WorkflowId) -> (NodeIndex, bool) {
        if let Some(index) = self.nodes.get(id) {
            return (*index, false);
        }
        let index = self.graph.add_node(id.clone());
        self.nodes.insert(id.clone(), index);
        (index, true)
    }

    fn drop_node(&mut self, index: NodeIndex) {
        if let Some(id) = self.graph.remove_node(index) {
            self.nodes.remove(&id);
        }
    }

    fn dependency(&self, edge: EdgeReference<'_, DependencyEdge>) -> Option<WorkflowDependency> {
        let source = self.graph.node_weight(edge.source())?.clone();
        let target = self.graph.node_weight(edge.target())?.clone();
        Some(WorkflowDependency {
            source,
            target,
            dependency_type: edge.weight().dependency_type,
            conditions: edge.weight().conditions.clone(),
        })
    }
}

#[derive(Default)]
pub struct DependencyGraph {
    inner: RwLock<GraphInner>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workflow(&self, id: &WorkflowId) {
        self.inner.write().ensure_node(id);
    }

    /// Inserts an edge, rejecting it if it would close a cycle.
    ///
    /// An existing edge between the same pair is replaced.
    pub fn add_dependency(&self, dependency: WorkflowDependency) -> Result<(), WorkflowError> {
        let mut inner = self.inner.write();
        let (source, source_created) = inner.ensure_node(&dependency.source);
        let (target, target_created) = inner.ensure_node(&dependency.target);
        let weight = DependencyEdge {
            dependency_type: dependency.dependency_type,
            conditions: dependency.conditions,
        };

        if let Some(existing) = inner.graph.find_edge(source, target) {
            if let Some(edge) = inner.graph.edge_weight_mut(existing) {
                *edge = weight;
            }
            return Ok(());
        }

        let edge = inner.graph.add_edge(source, target, weight);
        if petgraph::algo::is_cyclic_directed(&inner.graph) {
            inner.graph.remove_edge(edge);
            if target_created {
                inner.drop_node(target);
            }
            if source_created && !(source == target && target_created) {
                inner.drop_node(source);
            }
            tracing::debug!(from = %dependency.source, to = %dependency.target, "Rejected cyclic dependency");
            return Err(WorkflowError::CyclicDependency {
                from: dependency.source,
                to: dependency.target,
            });
        }
        Ok(())
    }

    pub fn remove_dependency(&self, source: &WorkflowId, target: &WorkflowId) -> bool {
        let mut inner = self.inner.write();
        let (Some(&from), Some(&to)) = (inner.nodes.get(source), inner.nodes.get(target)) else {
            return false;
        };
        match inner.graph.find_edge(from, to) {
            Some(edge) => inner.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// Removes the node and every edge touching it.
    pub fn remove_workflow(&self, id: &WorkflowId) -> bool {
        let mut inner = self.inner.write();
        match inner.nodes.get(id).copied() {
            Some(index) => {
                inner.drop_node(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &WorkflowId) -> bool {
        self.inner.read().nodes.contains_key(id)
    }

    /// Workflows that depend on `id`.
    pub fn dependents(&self, id: &WorkflowId) -> Vec<WorkflowId> {
        let inner = self.inner.read();
        let Some(&index) = inner.nodes.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<WorkflowId> = inner
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .filter_map(|n| inner.graph.node_weight(n).cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Incoming edges of `id`.
    pub fn dependencies(&self, id: &WorkflowId) -> Vec<WorkflowDependency> {
        let inner = self.inner.read();
        let Some(&index) = inner.nodes.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<WorkflowDependency> = inner
            .graph
            .edges_directed(index, Direction::Incoming)
            .filter_map(|edge| inner.dependency(edge))
            .collect();
        deps.sort_by(|a, b| a.source.cmp(&b.source));
        deps
    }

    pub fn edges(&self) -> Vec<WorkflowDependency> {
        let inner = self.inner.read();
        let mut deps: Vec<WorkflowDependency> = inner
            .graph
            .edge_references()
            .filter_map(|edge| inner.dependency(edge))
            .collect();
        deps.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        deps
    }

    /// Sources before targets.
    pub fn topological_order(&self) -> Result<Vec<WorkflowId>, WorkflowError> {
        let inner = self.inner.read();
        let order = petgraph::algo::toposort(&inner.graph, None).map_err(|cycle| {
            let at = inner
                .graph
                .node_weight(cycle.node_id())
                .cloned()
                .unwrap_or_else(|| WorkflowId::from("?"));
            WorkflowError::CyclicDependency {
                from: at.clone(),
                to: at,
            }
        })?;
        Ok(order
            .into_iter()
            .filter_map(|index| inner.graph.node_weight(index).cloned())
            .collect())
    }

    /// Evaluates every incoming edge of `id` with its type predicate.
    pub fn resolve(
        &self,
        id: &WorkflowId,
        context: &dyn DependencyContext,
    ) -> DependencyResolution {
        let unmet = self
            .dependencies(id)
            .into_iter()
            .filter_map(|dependency| {
                evaluate(&dependency, context).err().map(|reason| UnmetDependency {
                    source: dependency.source,
                    dependency_type: dependency.dependency_type,
                    reason,
                })
            })
            .collect();
        DependencyResolution {
            workflow_id: id.clone(),
            unmet,
        }
    }
}

fn evaluate(
    dependency: &WorkflowDependency,
    context: &dyn DependencyContext,
) -> Result<(), String> {
    let source = &dependency.source;
    match dependency.dependency_type {
        DependencyType::Parallel => Ok(()),
        DependencyType::Sequential => match context.status(source) {
            Some(WorkflowStatus::Completed) => Ok(()),
            Some(status) => Err(format!("source is {status}")),
            None => Err("source not found".to_string()),
        },
        DependencyType::Conditional => {
            let Some(condition) = &dependency.conditions.condition else {
                return Err("no condition stored on edge".to_string());
            };
            let Some(global) = context.global_context(source) else {
                return Err("source not found".to_string());
            };
            if condition.evaluate(global) {
                Ok(())
            } else {
                Err("condition not met".to_string())
            }
        }
        DependencyType::ResourceBased => {
            let missing: Vec<&str> = dependency
                .conditions
                .resources
                .iter()
                .map(String::as_str)
                .filter(|resource| !context.resource_available(resource))
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("unavailable resources: {}", missing.join(", ")))
            }
        }
        DependencyType::DataFlow => {
            let Some(global) = context.global_context(source) else {
                return Err("source not found".to_string());
            };
            let outputs = global.get(OUTPUTS_KEY).and_then(Value::as_object);
            let wanted = &dependency.conditions.outputs;
            let present = |key: &str| outputs.is_some_and(|map| map.contains_key(key));
            if wanted.is_empty() {
                return if outputs.is_some_and(|map| !map.is_empty()) {
                    Ok(())
                } else {
                    Err("source has published no outputs".to_string())
                };
            }
            let missing: Vec<&str> = wanted
                .iter()
                .map(String::as_str)
                .filter(|key| !present(key))
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("missing outputs: {}", missing.join(", ")))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/graph_tests.rs"]
mod tests;
