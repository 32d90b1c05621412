//! Event-sourced workflow orchestration for edge/cloud agent fleets.
//!
//! Workflows are event-sourced aggregates driven through one actor per
//! workflow. Around that core sit multi-agent coordination, inter-workflow
//! dependencies, conflict detection, failure recovery from checkpoints and
//! edge/cloud state reconciliation, all reachable through
//! [`engine::WorkflowEngine`].

pub mod cache;
pub mod config;
pub mod conflict;
pub mod consistency;
pub mod coordination;
pub mod dependency;
pub mod domain;
pub mod engine;
pub mod event_store;
pub mod recovery;
pub mod state_machine;
pub mod structured_logger;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use engine::{StartOutcome, WorkflowEngine, WorkflowEngineBuilder};
pub use structured_logger::JsonlLifecycleSink;
