use crate::conflict::{ConflictType, ResolutionStrategy};
use crate::consistency::ConsistencyLevel;
use crate::coordination::CoordinationProtocol;
use crate::domain::failure::{FailureKind, RecoveryStrategy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Engine configuration, usually loaded from YAML.
///
/// Every section and field is optional; an empty document yields the defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub event_store: EventStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub engine: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventStoreConfig {
    /// Persist a snapshot every N events. 0 disables snapshots.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            snapshot_every: default_snapshot_every(),
        }
    }
}

fn default_snapshot_every() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_hot_capacity")]
    pub hot_capacity: usize,
    #[serde(default = "default_warm_capacity")]
    pub warm_capacity: usize,
    /// Upper bound between two maintenance passes (drain + retirement).
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: default_hot_capacity(),
            warm_capacity: default_warm_capacity(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

fn default_hot_capacity() -> usize {
    256
}

fn default_warm_capacity() -> usize {
    4096
}

fn default_maintenance_interval_ms() -> u64 {
    500
}

/// Upper severity bound of each automatic strategy. Anything above
/// `rollback_max` is escalated to manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RecoveryThresholds {
    #[serde(default = "default_retry_max")]
    pub retry_max: u8,
    #[serde(default = "default_restore_max")]
    pub restore_max: u8,
    #[serde(default = "default_rollback_max")]
    pub rollback_max: u8,
}

impl Default for RecoveryThresholds {
    fn default() -> Self {
        Self {
            retry_max: default_retry_max(),
            restore_max: default_restore_max(),
            rollback_max: default_rollback_max(),
        }
    }
}

fn default_retry_max() -> u8 {
    3
}

fn default_restore_max() -> u8 {
    6
}

fn default_rollback_max() -> u8 {
    8
}

impl RecoveryThresholds {
    /// Strategy band for `severity`, before checkpoint and complexity checks.
    pub fn band(&self, severity: u8) -> RecoveryStrategy {
        if severity <= self.retry_max {
            RecoveryStrategy::Retry
        } else if severity <= self.restore_max {
            RecoveryStrategy::CheckpointRestore
        } else if severity <= self.rollback_max {
            RecoveryStrategy::PartialRollback
        } else {
            RecoveryStrategy::ManualIntervention
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub thresholds: RecoveryThresholds,
    /// Severity per failure kind. Kinds missing here use `default_severity`.
    #[serde(default = "default_severities")]
    pub severities: HashMap<FailureKind, u8>,
    #[serde(default = "default_failure_severity")]
    pub default_severity: u8,
    /// A restore is only chosen when the estimated complexity is at or below this.
    #[serde(default = "default_restore_complexity_limit")]
    pub restore_complexity_limit: usize,
    /// Checkpoints kept per workflow; the oldest are dropped first.
    #[serde(default = "default_checkpoints_kept")]
    pub checkpoints_kept: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            thresholds: RecoveryThresholds::default(),
            severities: default_severities(),
            default_severity: default_failure_severity(),
            restore_complexity_limit: default_restore_complexity_limit(),
            checkpoints_kept: default_checkpoints_kept(),
        }
    }
}

fn default_severities() -> HashMap<FailureKind, u8> {
    HashMap::from([
        (FailureKind::AgentFailure, 5),
        (FailureKind::Timeout, 3),
        (FailureKind::Network, 2),
        (FailureKind::CoordinationTimeout, 4),
        (FailureKind::DataCorruption, 7),
        (FailureKind::SafetyViolation, 9),
        (FailureKind::ConflictUnresolved, 9),
        (FailureKind::Storage, 6),
        (FailureKind::Transport, 3),
        (FailureKind::Unknown, 5),
    ])
}

fn default_failure_severity() -> u8 {
    5
}

fn default_restore_complexity_limit() -> usize {
    5
}

fn default_checkpoints_kept() -> usize {
    10
}

impl RecoveryConfig {
    pub fn severity_of(&self, kind: &FailureKind) -> u8 {
        self.severities
            .get(kind)
            .copied()
            .unwrap_or(self.default_severity)
    }
}

/// Severity assigned by each detection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConflictSeverities {
    #[serde(default = "default_resource_contention_severity")]
    pub resource_contention: u8,
    #[serde(default = "default_temporal_overlap_severity")]
    pub temporal_overlap: u8,
    #[serde(default = "default_data_consistency_severity")]
    pub data_consistency: u8,
    #[serde(default = "default_safety_zone_severity")]
    pub safety_zone: u8,
}

impl Default for ConflictSeverities {
    fn default() -> Self {
        Self {
            resource_contention: default_resource_contention_severity(),
            temporal_overlap: default_temporal_overlap_severity(),
            data_consistency: default_data_consistency_severity(),
            safety_zone: default_safety_zone_severity(),
        }
    }
}

fn default_resource_contention_severity() -> u8 {
    6
}

fn default_temporal_overlap_severity() -> u8 {
    4
}

fn default_data_consistency_severity() -> u8 {
    5
}

fn default_safety_zone_severity() -> u8 {
    9
}

impl ConflictSeverities {
    pub fn for_type(&self, conflict_type: ConflictType) -> u8 {
        match conflict_type {
            ConflictType::ResourceContention => self.resource_contention,
            ConflictType::TemporalOverlap => self.temporal_overlap,
            ConflictType::DataConsistency => self.data_consistency,
            ConflictType::SafetyZone => self.safety_zone,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConflictConfig {
    /// Period of the background conflict scan. 0 disables it.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Conflicts at or above this severity are escalated, never auto-resolved.
    #[serde(default = "default_escalation_severity")]
    pub escalation_severity: u8,
    #[serde(default)]
    pub severities: ConflictSeverities,
    #[serde(default = "default_strategies")]
    pub strategies: HashMap<ConflictType, ResolutionStrategy>,
    /// Delay applied by temporal reschedule when no window end is known.
    #[serde(default = "default_reschedule_delay_ms")]
    pub reschedule_delay_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            escalation_severity: default_escalation_severity(),
            severities: ConflictSeverities::default(),
            strategies: default_strategies(),
            reschedule_delay_ms: default_reschedule_delay_ms(),
        }
    }
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_escalation_severity() -> u8 {
    10
}

fn default_strategies() -> HashMap<ConflictType, ResolutionStrategy> {
    HashMap::from([
        (
            ConflictType::ResourceContention,
            ResolutionStrategy::ResourceReallocation,
        ),
        (
            ConflictType::TemporalOverlap,
            ResolutionStrategy::TemporalReschedule,
        ),
        (ConflictType::DataConsistency, ResolutionStrategy::Negotiation),
        (ConflictType::SafetyZone, ResolutionStrategy::PriorityPreemption),
    ])
}

fn default_reschedule_delay_ms() -> u64 {
    1_000
}

impl ConflictConfig {
    pub fn strategy_for(&self, conflict_type: ConflictType) -> ResolutionStrategy {
        self.strategies
            .get(&conflict_type)
            .copied()
            .unwrap_or_else(|| conflict_type.default_strategy())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinationConfig {
    /// Protocol for workflows that were not configured explicitly.
    #[serde(default)]
    pub default_protocol: CoordinationProtocol,
    /// A barrier closed for longer than this raises a coordination timeout.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            default_protocol: CoordinationProtocol::default(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsistencyConfig {
    #[serde(default)]
    pub level: ConsistencyLevel,
    /// Bounded staleness: reconcile now once the remote copy is this old.
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: u64,
    /// Bounded staleness: reconcile now once versions drift this far apart.
    #[serde(default = "default_max_version_lag")]
    pub max_version_lag: u64,
    /// Bound on a synchronous round trip.
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            level: ConsistencyLevel::default(),
            max_staleness_ms: default_max_staleness_ms(),
            max_version_lag: default_max_version_lag(),
            timeout_ms: default_sync_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_max_staleness_ms() -> u64 {
    5_000
}

fn default_max_version_lag() -> u64 {
    10
}

fn default_sync_timeout_ms() -> u64 {
    2_000
}

fn default_queue_capacity() -> usize {
    256
}

impl ConsistencyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Period of the watchdog checking stalled barriers and workflow timeouts.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Capacity of the committed-event broadcast channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: default_watchdog_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_watchdog_interval_ms() -> u64 {
    1_000
}

fn default_event_channel_capacity() -> usize {
    1_024
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.hot_capacity == 0 || self.cache.warm_capacity == 0 {
            anyhow::bail!("Cache tiers need a capacity of at least 1");
        }
        if self.cache.maintenance_interval_ms == 0 {
            anyhow::bail!("cache.maintenance_interval_ms must be positive");
        }

        let thresholds = &self.recovery.thresholds;
        if !(thresholds.retry_max <= thresholds.restore_max
            && thresholds.restore_max <= thresholds.rollback_max)
        {
            anyhow::bail!(
                "Recovery thresholds must be ordered retry <= restore <= rollback (got {}, {}, {})",
                thresholds.retry_max,
                thresholds.restore_max,
                thresholds.rollback_max
            );
        }
        if thresholds.rollback_max > 10 {
            anyhow::bail!("recovery.thresholds.rollback_max must be at most 10");
        }
        for (kind, severity) in &self.recovery.severities {
            check_severity(&format!("recovery.severities.{kind}"), *severity)?;
        }
        check_severity("recovery.default_severity", self.recovery.default_severity)?;
        if self.recovery.checkpoints_kept == 0 {
            anyhow::bail!("recovery.checkpoints_kept must be at least 1");
        }

        let severities = &self.conflict.severities;
        for conflict_type in ConflictType::ALL {
            check_severity(
                &format!("conflict.severities.{conflict_type}"),
                severities.for_type(conflict_type),
            )?;
        }
        check_severity(
            "conflict.escalation_severity",
            self.conflict.escalation_severity,
        )?;

        if self.coordination.stall_timeout_ms == 0 {
            anyhow::bail!("coordination.stall_timeout_ms must be positive");
        }

        if self.consistency.queue_capacity == 0 {
            anyhow::bail!("consistency.queue_capacity must be at least 1");
        }
        if self.consistency.timeout_ms == 0 {
            anyhow::bail!("consistency.timeout_ms must be positive");
        }

        if self.engine.event_channel_capacity == 0 {
            anyhow::bail!("engine.event_channel_capacity must be at least 1");
        }
        if self.engine.watchdog_interval_ms == 0 {
            anyhow::bail!("engine.watchdog_interval_ms must be positive");
        }

        Ok(())
    }
}

fn check_severity(field: &str, severity: u8) -> Result<()> {
    if !(1..=10).contains(&severity) {
        anyhow::bail!("{field} must be within 1..=10, got {severity}");
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
