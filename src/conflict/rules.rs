//! Detection rules. Each rule looks at the claims of in-flight steps and
//! reports findings of exactly one conflict type.

use super::{ConflictParty, ConflictType, StepClaim};
use std::collections::BTreeMap;

/// A raw finding before severity and strategy are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    /// What the parties contend for (`agent:a1`, `zone:cell-4`, ...).
    pub subject: String,
    pub parties: Vec<ConflictParty>,
    pub description: String,
}

pub trait ConflictRule: Send + Sync {
    fn conflict_type(&self) -> ConflictType;

    fn detect(&self, claims: &[StepClaim]) -> Vec<Finding>;
}

/// Groups running claims by key and reports every group with more than one
/// distinct step.
fn shared_by<F>(claims: &[StepClaim], keys: F) -> BTreeMap<String, Vec<ConflictParty>>
where
    F: Fn(&StepClaim) -> Vec<String>,
{
    let mut groups: BTreeMap<String, Vec<ConflictParty>> = BTreeMap::new();
    for claim in claims.iter().filter(|claim| claim.running) {
        for key in keys(claim) {
            groups.entry(key).or_default().push(claim.party());
        }
    }
    groups.retain(|_, parties| parties.len() > 1);
    groups
}

/// One agent assigned to more than one running step, or one named resource
/// claimed by more than one running step.
pub struct ResourceContentionRule;

impl ConflictRule for ResourceContentionRule {
    fn conflict_type(&self) -> ConflictType {
        ConflictType::ResourceContention
    }

    fn detect(&self, claims: &[StepClaim]) -> Vec<Finding> {
        shared_by(claims, |claim| {
            let mut keys: Vec<String> = claim
                .constraints
                .resources
                .iter()
                .map(|resource| format!("resource:{resource}"))
                .collect();
            if let Some(agent) = &claim.agent_id {
                keys.push(format!("agent:{agent}"));
            }
            keys
        })
        .into_iter()
        .map(|(subject, parties)| Finding {
            description: format!("{} running steps hold {subject}", parties.len()),
            subject,
            parties,
        })
        .collect()
    }
}

/// Reserved windows that overlap on a shared agent or resource, where at
/// least one side has not started yet.
pub struct TemporalOverlapRule;

impl ConflictRule for TemporalOverlapRule {
    fn conflict_type(&self) -> ConflictType {
        ConflictType::TemporalOverlap
    }

    fn detect(&self, claims: &[StepClaim]) -> Vec<Finding> {
        let windowed: Vec<&StepClaim> = claims
            .iter()
            .filter(|claim| claim.constraints.window.is_some())
            .collect();

        let mut findings = Vec::new();
        for (index, first) in windowed.iter().enumerate() {
            for second in windowed.iter().skip(index + 1) {
                if first.running && second.running {
                    continue;
                }
                let (Some(a), Some(b)) = (first.constraints.window, second.constraints.window)
                else {
                    continue;
                };
                if !a.overlaps(&b) {
                    continue;
                }
                let Some(shared) = first.shared_holding(second) else {
                    continue;
                };
                findings.push(Finding {
                    description: format!(
                        "reserved windows of {}/{} and {}/{} overlap on {shared}",
                        first.workflow_id, first.step_id, second.workflow_id, second.step_id
                    ),
                    subject: shared,
                    parties: vec![first.party(), second.party()],
                });
            }
        }
        findings
    }
}

/// Running steps writing the same data key.
pub struct DataConsistencyRule;

impl ConflictRule for DataConsistencyRule {
    fn conflict_type(&self) -> ConflictType {
        ConflictType::DataConsistency
    }

    fn detect(&self, claims: &[StepClaim]) -> Vec<Finding> {
        shared_by(claims, |claim| {
            claim
                .constraints
                .writes
                .iter()
                .map(|key| format!("data:{key}"))
                .collect()
        })
        .into_iter()
        .map(|(subject, parties)| Finding {
            description: format!("{} running steps write {subject}", parties.len()),
            subject,
            parties,
        })
        .collect()
    }
}

/// Running steps occupying the same exclusive safety zone.
pub struct SafetyZoneRule;

impl ConflictRule for SafetyZoneRule {
    fn conflict_type(&self) -> ConflictType {
        ConflictType::SafetyZone
    }

    fn detect(&self, claims: &[StepClaim]) -> Vec<Finding> {
        shared_by(claims, |claim| {
            claim
                .constraints
                .zone
                .iter()
                .map(|zone| format!("zone:{zone}"))
                .collect()
        })
        .into_iter()
        .map(|(subject, parties)| Finding {
            description: format!("{} running steps occupy {subject}", parties.len()),
            subject,
            parties,
        })
        .collect()
    }
}

/// The four built-in rules.
pub fn default_rules() -> Vec<Box<dyn ConflictRule>> {
    vec![
        Box::new(ResourceContentionRule),
        Box::new(TemporalOverlapRule),
        Box::new(DataConsistencyRule),
        Box::new(SafetyZoneRule),
    ]
}
