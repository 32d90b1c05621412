//! Resolution strategies. A strategy only plans compensating commands; the
//! engine submits them to the affected workflows.

use super::{ConflictAction, ConflictParty, ResolutionStrategy, WorkflowConflict};
use crate::domain::cqrs::WorkflowCommand;
use crate::domain::types::TimestampUtc;
use std::cmp::Ordering;

/// Inputs a strategy may use besides the conflict itself.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext {
    pub now: TimestampUtc,
    pub reschedule_delay_ms: u64,
}

pub trait ResolutionPlanner: Send + Sync {
    /// Compensating actions, or `None` when the strategy cannot decide.
    fn plan(&self, conflict: &WorkflowConflict, context: &PlanContext)
        -> Option<Vec<ConflictAction>>;
}

/// Winner first: higher priority, then earlier start, then id order.
fn ranked(parties: &[ConflictParty]) -> Vec<&ConflictParty> {
    let mut ranked: Vec<&ConflictParty> = parties.iter().collect();
    ranked.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.started_at, b.started_at) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| (&a.workflow_id, &a.step_id).cmp(&(&b.workflow_id, &b.step_id)))
    });
    ranked
}

fn preempt(party: &ConflictParty, reason: String) -> ConflictAction {
    ConflictAction {
        workflow_id: party.workflow_id.clone(),
        step_id: Some(party.step_id.clone()),
        command: WorkflowCommand::PreemptStep {
            step_id: party.step_id.clone(),
            reason,
        },
    }
}

fn reschedule(party: &ConflictParty, not_before: TimestampUtc, reason: String) -> ConflictAction {
    ConflictAction {
        workflow_id: party.workflow_id.clone(),
        step_id: Some(party.step_id.clone()),
        command: WorkflowCommand::RescheduleStep {
            step_id: party.step_id.clone(),
            not_before,
            reason,
        },
    }
}

/// The top-ranked party keeps the contended agent or resource; the others
/// are preempted and re-dispatched to a different agent.
pub struct ResourceReallocation;

impl ResolutionPlanner for ResourceReallocation {
    fn plan(
        &self,
        conflict: &WorkflowConflict,
        _context: &PlanContext,
    ) -> Option<Vec<ConflictAction>> {
        let ranked = ranked(&conflict.parties);
        let (winner, losers) = ranked.split_first()?;
        if losers.is_empty() {
            return None;
        }
        Some(
            losers
                .iter()
                .filter(|party| party.running)
                .map(|party| {
                    preempt(
                        party,
                        format!(
                            "{} reallocated to {}/{}",
                            conflict.subject, winner.workflow_id, winner.step_id
                        ),
                    )
                })
                .collect(),
        )
    }
}

/// Strictly higher priority wins. A tie at the top cannot be decided here.
pub struct PriorityPreemption;

impl ResolutionPlanner for PriorityPreemption {
    fn plan(
        &self,
        conflict: &WorkflowConflict,
        _context: &PlanContext,
    ) -> Option<Vec<ConflictAction>> {
        let ranked = ranked(&conflict.parties);
        let (winner, losers) = ranked.split_first()?;
        let runner_up = losers.first()?;
        if runner_up.priority == winner.priority {
            return None;
        }
        Some(
            losers
                .iter()
                .map(|party| {
                    preempt(
                        party,
                        format!(
                            "preempted on {} by priority {} workflow {}",
                            conflict.subject, winner.priority, winner.workflow_id
                        ),
                    )
                })
                .collect(),
        )
    }
}

/// Parties agree on an order: each one after the top-ranked waits one more
/// delay slot before touching the shared data again.
pub struct Negotiation;

impl ResolutionPlanner for Negotiation {
    fn plan(
        &self,
        conflict: &WorkflowConflict,
        context: &PlanContext,
    ) -> Option<Vec<ConflictAction>> {
        let ranked = ranked(&conflict.parties);
        if ranked.len() < 2 {
            return None;
        }
        Some(
            ranked
                .iter()
                .enumerate()
                .skip(1)
                .map(|(slot, party)| {
                    let delay = context.reschedule_delay_ms.saturating_mul(slot as u64);
                    reschedule(
                        party,
                        context.now.plus_millis(delay),
                        format!("negotiated slot {slot} on {}", conflict.subject),
                    )
                })
                .collect(),
        )
    }
}

/// Lower-ranked parties move after the end of every higher-ranked window.
pub struct TemporalReschedule;

impl ResolutionPlanner for TemporalReschedule {
    fn plan(
        &self,
        conflict: &WorkflowConflict,
        context: &PlanContext,
    ) -> Option<Vec<ConflictAction>> {
        let ranked = ranked(&conflict.parties);
        if ranked.len() < 2 {
            return None;
        }
        let mut actions = Vec::new();
        let mut latest_end: Option<TimestampUtc> = None;
        for (index, party) in ranked.iter().enumerate() {
            if index > 0 {
                let not_before = latest_end
                    .unwrap_or_else(|| context.now.plus_millis(context.reschedule_delay_ms));
                actions.push(reschedule(
                    party,
                    not_before,
                    format!("window moved after {} reservation", conflict.subject),
                ));
            }
            if let Some(window) = party.window {
                latest_end = Some(latest_end.map_or(window.end, |end| end.max(window.end)));
            }
        }
        Some(actions)
    }
}

/// Planner for a built-in strategy.
pub fn planner_for(strategy: ResolutionStrategy) -> Box<dyn ResolutionPlanner> {
    match strategy {
        ResolutionStrategy::ResourceReallocation => Box::new(ResourceReallocation),
        ResolutionStrategy::PriorityPreemption => Box::new(PriorityPreemption),
        ResolutionStrategy::Negotiation => Box::new(Negotiation),
        ResolutionStrategy::TemporalReschedule => Box::new(TemporalReschedule),
    }
}
