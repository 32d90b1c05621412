//! Divergence resolution between the edge copy and the cloud copy.
//!
//! Order: semantic precedence of domain flags, then a field-level merge when
//! both sides changed since the last agreed state, then last-write-wins.

use super::{DomainFlag, ReplicaState};
use crate::domain::snapshot::ExecutionState;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Which rule decided a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionRule {
    /// Both copies already hold the same state.
    Identical,
    /// One side carries a higher-precedence domain flag.
    Semantic,
    /// Both sides changed since the last agreed state.
    Merge,
    LastWriteWins,
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionRule::Identical => "identical",
            ResolutionRule::Semantic => "semantic",
            ResolutionRule::Merge => "merge",
            ResolutionRule::LastWriteWins => "last_write_wins",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
    Merged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub rule: ResolutionRule,
    pub winner: Side,
    pub state: ReplicaState,
}

/// Resolves `local` against `remote`. `base` is the last state both sides
/// agreed on, if any.
pub fn resolve(local: &ReplicaState, remote: &ReplicaState, base: Option<&ReplicaState>) -> Resolution {
    if local.state == remote.state {
        let (winner, state) = if local.version >= remote.version {
            (Side::Local, local.clone())
        } else {
            (Side::Remote, remote.clone())
        };
        return Resolution {
            rule: ResolutionRule::Identical,
            winner,
            state,
        };
    }

    match (local.precedence(), remote.precedence()) {
        (Some(l), Some(r)) if l != r => return semantic(local, remote, l > r),
        (Some(_), None) => return semantic(local, remote, true),
        (None, Some(_)) => return semantic(local, remote, false),
        _ => {}
    }

    if let Some(base) = base {
        if local.state != base.state && remote.state != base.state {
            return merge(local, remote, base);
        }
    }

    let (side, state) = if local_is_newer(local, remote) {
        (Side::Local, local.clone())
    } else {
        (Side::Remote, remote.clone())
    };
    Resolution {
        rule: ResolutionRule::LastWriteWins,
        winner: side,
        state,
    }
}

fn semantic(local: &ReplicaState, remote: &ReplicaState, local_wins: bool) -> Resolution {
    let (winner, state) = if local_wins {
        (Side::Local, local.clone())
    } else {
        (Side::Remote, remote.clone())
    };
    Resolution {
        rule: ResolutionRule::Semantic,
        winner,
        state,
    }
}

/// Newer timestamp wins; equal timestamps fall to the higher version, then
/// to the cloud copy.
fn local_is_newer(local: &ReplicaState, remote: &ReplicaState) -> bool {
    (local.timestamp, local.version) > (remote.timestamp, remote.version)
}

fn merge(local: &ReplicaState, remote: &ReplicaState, base: &ReplicaState) -> Resolution {
    let local_newer = local_is_newer(local, remote);
    let pick = |b: Option<&Value>, l: Option<&Value>, r: Option<&Value>| -> Option<Value> {
        pick_field(b, l, r, local_newer)
    };

    let phase = if local.state.phase == base.state.phase {
        remote.state.phase
    } else if remote.state.phase == base.state.phase || local_newer {
        local.state.phase
    } else {
        remote.state.phase
    };

    let steps = merge_maps(
        &to_values(&base.state.steps),
        &to_values(&local.state.steps),
        &to_values(&remote.state.steps),
        &pick,
    );
    let assigned_agents = merge_maps(
        &to_values(&base.state.assigned_agents),
        &to_values(&local.state.assigned_agents),
        &to_values(&remote.state.assigned_agents),
        &pick,
    );
    let global_context: Map<String, Value> = merge_maps(
        &base.state.global_context.clone().into_iter().collect(),
        &local.state.global_context.clone().into_iter().collect(),
        &remote.state.global_context.clone().into_iter().collect(),
        &pick,
    )
    .into_iter()
    .collect();

    let state = ExecutionState {
        phase,
        steps: from_values(steps),
        assigned_agents: from_values(assigned_agents),
        global_context,
    };

    let mut domain_flags = local.domain_flags.clone();
    domain_flags.extend(remote.domain_flags.iter().copied());

    Resolution {
        rule: ResolutionRule::Merge,
        winner: Side::Merged,
        state: ReplicaState {
            workflow_id: local.workflow_id.clone(),
            version: local.version.max(remote.version) + 1,
            timestamp: local.timestamp.max(remote.timestamp),
            state,
            domain_flags,
            merged: true,
        },
    }
}

/// Per-field three-way choice. A field changed on one side only takes that
/// side; a field changed on both sides takes the newer side.
fn pick_field(
    base: Option<&Value>,
    local: Option<&Value>,
    remote: Option<&Value>,
    local_newer: bool,
) -> Option<Value> {
    let local_changed = local != base;
    let remote_changed = remote != base;
    let chosen = match (local_changed, remote_changed) {
        (true, false) => local,
        (false, _) => remote,
        (true, true) if local_newer => local,
        (true, true) => remote,
    };
    chosen.cloned()
}

fn merge_maps<F>(
    base: &BTreeMap<String, Value>,
    local: &BTreeMap<String, Value>,
    remote: &BTreeMap<String, Value>,
    pick: &F,
) -> BTreeMap<String, Value>
where
    F: Fn(Option<&Value>, Option<&Value>, Option<&Value>) -> Option<Value>,
{
    let mut keys: Vec<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .filter_map(|key| {
            pick(base.get(key), local.get(key), remote.get(key)).map(|value| (key.clone(), value))
        })
        .collect()
}

fn to_values<K, V>(map: &BTreeMap<K, V>) -> BTreeMap<String, Value>
where
    K: fmt::Display,
    V: serde::Serialize,
{
    map.iter()
        .filter_map(|(key, value)| {
            serde_json::to_value(value)
                .ok()
                .map(|value| (key.to_string(), value))
        })
        .collect()
}

fn from_values<K, V>(map: BTreeMap<String, Value>) -> BTreeMap<K, V>
where
    K: From<String> + Ord,
    V: serde::de::DeserializeOwned,
{
    map.into_iter()
        .filter_map(|(key, value)| {
            serde_json::from_value(value)
                .ok()
                .map(|value| (K::from(key), value))
        })
        .collect()
}

impl ReplicaState {
    /// Highest-precedence domain flag carried by this copy.
    pub fn precedence(&self) -> Option<DomainFlag> {
        self.domain_flags.iter().copied().max()
    }
}
