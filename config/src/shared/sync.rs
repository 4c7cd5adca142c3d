use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{BatchConfig, ValidationError};

/// How changed rows are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// Compare content fingerprints of every row.
    #[default]
    Hash,
    /// Only consider rows whose modification column moved past the last checkpoint.
    Timestamp,
}

/// Strategy used to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    SourceWins,
    TargetWins,
    NewestWins,
    #[default]
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::SourceWins => "source_wins",
            ConflictStrategy::TargetWins => "target_wins",
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "source_wins" => Ok(ConflictStrategy::SourceWins),
            "target_wins" => Ok(ConflictStrategy::TargetWins),
            "newest_wins" => Ok(ConflictStrategy::NewestWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(format!("unknown conflict strategy `{other}`")),
        }
    }
}

/// Ledger based rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of days ledger entries are kept and can be reverted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
        }
    }
}

/// Exponential backoff applied to failed reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Settings consumed when a sync job is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    /// Seconds between automatically triggered incremental jobs.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub auto_trigger: bool,
    /// Tables synchronized by automatically triggered jobs.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub detection_strategy: DetectionStrategy,
    #[serde(default)]
    pub default_conflict_strategy: ConflictStrategy,
    /// When disabled, checkpoints are neither read nor written and every job scans fully.
    #[serde(default = "default_true")]
    pub change_tracking_enabled: bool,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default = "default_max_parallel_tables")]
    pub max_parallel_tables: usize,
    #[serde(default = "default_max_parallel_operations")]
    pub max_parallel_operations: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Keeps a job `running` until its pending conflicts are resolved.
    #[serde(default)]
    pub require_conflict_resolution: bool,
    /// Column holding the last modification time of a row, present on both sides.
    #[serde(default)]
    pub modified_column: Option<String>,
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;

        for (field, value) in [
            ("sync.max_parallel_tables", self.max_parallel_tables as u64),
            (
                "sync.max_parallel_operations",
                self.max_parallel_operations as u64,
            ),
            ("sync.retry.max_attempts", self.retry.max_attempts as u64),
            ("sync.rollback.retention_days", self.rollback.retention_days as u64),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: field.to_string(),
                    constraint: "must be greater than 0".to_string(),
                });
            }
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "sync.retry.initial_delay_ms".to_string(),
                constraint: "must not exceed `sync.retry.max_delay_ms`".to_string(),
            });
        }

        if self.detection_strategy == DetectionStrategy::Timestamp
            && self.modified_column.as_deref().is_none_or(str::is_empty)
        {
            return Err(ValidationError::MissingModifiedColumn);
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.as_str()) {
                return Err(ValidationError::DuplicateTable(table.clone()));
            }
        }

        if self.auto_trigger {
            if self.tables.is_empty() {
                return Err(ValidationError::AutoTriggerWithoutTables);
            }
            if self.sync_interval_secs == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: "sync.sync_interval_secs".to_string(),
                    constraint: "must be greater than 0 when `auto_trigger` is enabled"
                        .to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            sync_interval_secs: default_sync_interval_secs(),
            auto_trigger: false,
            tables: Vec::new(),
            detection_strategy: DetectionStrategy::default(),
            default_conflict_strategy: ConflictStrategy::default(),
            change_tracking_enabled: true,
            rollback: RollbackConfig::default(),
            max_parallel_tables: default_max_parallel_tables(),
            max_parallel_operations: default_max_parallel_operations(),
            retry: RetryConfig::default(),
            require_conflict_resolution: false,
            modified_column: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_sync_interval_secs() -> u64 {
    3600
}

fn default_max_parallel_tables() -> usize {
    4
}

fn default_max_parallel_operations() -> usize {
    4
}
