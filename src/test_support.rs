//! Shared fixtures for unit tests.

use crate::domain::types::{
    AgentId, StepConstraints, StepId, StepType, WorkflowDefinition, WorkflowStepDefinition,
};
use crate::domain::{WorkflowAggregate, WorkflowCommand, WorkflowEvent, WorkflowServices};
use crate::cache::TieredCache;
use crate::event_store::WorkflowEventStore;
use cqrs_es::Aggregate;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Three sequential steps `s1 -> s2 -> s3`.
pub fn sequential_definition(id: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(
        id,
        vec![
            WorkflowStepDefinition::sequential("s1"),
            WorkflowStepDefinition::sequential("s2"),
            WorkflowStepDefinition::sequential("s3"),
        ],
    )
    .with_candidates(vec![AgentId::from("a1"), AgentId::from("a2")])
}

/// Single parallel step pinned to `agent`, with the given constraints.
pub fn single_step_definition(
    id: &str,
    agent: &str,
    priority: u8,
    constraints: StepConstraints,
) -> WorkflowDefinition {
    WorkflowDefinition::new(
        id,
        vec![WorkflowStepDefinition::new("work", StepType::Parallel)
            .with_agent(agent)
            .with_constraints(constraints)],
    )
    .with_priority(priority)
}

pub fn step(id: &str) -> StepId {
    StepId::from(id)
}

/// Runs commands through `handle` + `apply`; panics on a rejection.
pub async fn drive(
    aggregate: &mut WorkflowAggregate,
    commands: Vec<WorkflowCommand>,
) -> Vec<WorkflowEvent> {
    let services = WorkflowServices::default();
    let mut recorded = Vec::new();
    for command in commands {
        let events = aggregate
            .handle(command, &services)
            .await
            .expect("command accepted");
        for event in events {
            aggregate.apply(event.clone());
            recorded.push(event);
        }
    }
    recorded
}

/// Cache whose misses rebuild from `store`.
pub fn cache_over(store: &WorkflowEventStore, hot: usize, warm: usize) -> Arc<TieredCache> {
    let size = |n: usize| NonZeroUsize::new(n).expect("non-zero capacity");
    Arc::new(TieredCache::new(size(hot), size(warm), Arc::new(store.clone())))
}
