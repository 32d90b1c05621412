//! Coordination protocols: how released agents are told to proceed.
//!
//! A protocol never changes barrier semantics. It only turns the set of
//! participants of one release into per-agent directives.

use crate::domain::types::AgentId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationProtocol {
    /// First arrival leads, the others follow in arrival order.
    #[default]
    LeaderFollower,
    /// Every participant proceeds together as a peer.
    Consensus,
    /// Highest bid leads, the others stand by in bid order.
    AuctionBased,
    /// Lowest agent id supervises, the others report to it.
    Hierarchical,
}

impl fmt::Display for CoordinationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinationProtocol::LeaderFollower => "leader_follower",
            CoordinationProtocol::Consensus => "consensus",
            CoordinationProtocol::AuctionBased => "auction_based",
            CoordinationProtocol::Hierarchical => "hierarchical",
        };
        f.write_str(name)
    }
}

/// Role assigned to one agent at release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ProceedRole {
    Leader,
    Follower { leader: AgentId },
    Peer,
    Winner,
    Standby { winner: AgentId },
    Supervisor,
    Subordinate { supervisor: AgentId },
}

/// What one participant should do after a barrier releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProceedDirective {
    pub agent_id: AgentId,
    pub role: ProceedRole,
    /// Position in the proceed order; equal values may go together.
    pub order: usize,
}

impl CoordinationProtocol {
    /// Directives for `arrivals` (in arrival order). `bids` is only read by
    /// the auction protocol; agents without a bid count as 0.
    pub fn directives(
        &self,
        arrivals: &[AgentId],
        bids: &HashMap<AgentId, f64>,
    ) -> Vec<ProceedDirective> {
        match self {
            CoordinationProtocol::LeaderFollower => {
                let Some(leader) = arrivals.first() else {
                    return Vec::new();
                };
                arrivals
                    .iter()
                    .enumerate()
                    .map(|(order, agent)| ProceedDirective {
                        agent_id: agent.clone(),
                        role: if order == 0 {
                            ProceedRole::Leader
                        } else {
                            ProceedRole::Follower {
                                leader: leader.clone(),
                            }
                        },
                        order,
                    })
                    .collect()
            }
            CoordinationProtocol::Consensus => arrivals
                .iter()
                .map(|agent| ProceedDirective {
                    agent_id: agent.clone(),
                    role: ProceedRole::Peer,
                    order: 0,
                })
                .collect(),
            CoordinationProtocol::AuctionBased => {
                let mut ranked: Vec<&AgentId> = arrivals.iter().collect();
                let bid = |agent: &AgentId| bids.get(agent).copied().unwrap_or(0.0);
                ranked.sort_by(|a, b| {
                    bid(b)
                        .partial_cmp(&bid(a))
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.cmp(b))
                });
                let Some(winner) = ranked.first().map(|agent| (*agent).clone()) else {
                    return Vec::new();
                };
                ranked
                    .into_iter()
                    .enumerate()
                    .map(|(order, agent)| ProceedDirective {
                        agent_id: agent.clone(),
                        role: if order == 0 {
                            ProceedRole::Winner
                        } else {
                            ProceedRole::Standby {
                                winner: winner.clone(),
                            }
                        },
                        order,
                    })
                    .collect()
            }
            CoordinationProtocol::Hierarchical => {
                let mut ranked: Vec<&AgentId> = arrivals.iter().collect();
                ranked.sort();
                let Some(supervisor) = ranked.first().map(|agent| (*agent).clone()) else {
                    return Vec::new();
                };
                ranked
                    .into_iter()
                    .map(|agent| {
                        if *agent == supervisor {
                            ProceedDirective {
                                agent_id: agent.clone(),
                                role: ProceedRole::Supervisor,
                                order: 0,
                            }
                        } else {
                            ProceedDirective {
                                agent_id: agent.clone(),
                                role: ProceedRole::Subordinate {
                                    supervisor: supervisor.clone(),
                                },
                                order: 1,
                            }
                        }
                    })
                    .collect()
            }
        }
    }
}
