use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use config::shared::{
    ConflictStrategy, DetectionStrategy, RetryConfig, RollbackConfig, SyncConfig, ValidationError,
};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::types::JobId;

/// Whether a job compares every row or only rows touched since the last checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Incremental,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Full => "full",
            JobKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(JobKind::Full),
            "incremental" => Ok(JobKind::Incremental),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// Lifecycle state of a [`SyncJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Deleted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
            JobStatus::Deleted => "deleted",
        }
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Failed, Running)
                | (Pending | Completed | Failed | Stopped, Deleted)
        )
    }

    /// Validates a move to `next` and returns it.
    ///
    /// Fails with [`ErrorKind::InvalidState`] for every move outside of the job state machine.
    pub fn transition(self, next: JobStatus) -> SyncResult<JobStatus> {
        if !self.can_transition_to(next) {
            bail!(
                ErrorKind::InvalidState,
                "Invalid job state transition",
                format!("A job cannot move from '{self}' to '{next}'")
            );
        }

        Ok(next)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            "deleted" => Ok(JobStatus::Deleted),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Control action requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Stop,
    Resume,
    Delete,
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(JobAction::Stop),
            "resume" => Ok(JobAction::Resume),
            "delete" => Ok(JobAction::Delete),
            other => Err(format!("unknown job action '{other}'")),
        }
    }
}

/// Settings frozen into a job when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub batch_size: usize,
    pub detection_strategy: DetectionStrategy,
    pub default_conflict_strategy: ConflictStrategy,
    pub max_parallel_tables: usize,
    pub max_parallel_operations: usize,
    pub require_conflict_resolution: bool,
    pub modified_column: Option<String>,
    pub change_tracking_enabled: bool,
    pub retry: RetryConfig,
    pub rollback: RollbackConfig,
}

impl JobConfig {
    pub fn validate(&self) -> SyncResult<()> {
        let sync_config = SyncConfig {
            batch: config::shared::BatchConfig {
                max_size: self.batch_size,
            },
            detection_strategy: self.detection_strategy,
            default_conflict_strategy: self.default_conflict_strategy,
            max_parallel_tables: self.max_parallel_tables,
            max_parallel_operations: self.max_parallel_operations,
            require_conflict_resolution: self.require_conflict_resolution,
            modified_column: self.modified_column.clone(),
            change_tracking_enabled: self.change_tracking_enabled,
            retry: self.retry.clone(),
            rollback: self.rollback.clone(),
            ..SyncConfig::default()
        };

        sync_config.validate()?;

        if self.modified_column.as_deref() == Some("") {
            return Err(ValidationError::MissingModifiedColumn.into());
        }

        Ok(())
    }

    /// Returns whether a job of `kind` filters source rows by the last checkpoint.
    pub fn uses_checkpoint(&self, kind: JobKind) -> bool {
        kind == JobKind::Incremental
            && self.change_tracking_enabled
            && self.modified_column.is_some()
    }

    /// Returns whether detection of a job of `kind` can observe deleted source rows.
    ///
    /// A timestamp filtered scan only sees rows that still exist.
    pub fn detects_deletes(&self, kind: JobKind) -> bool {
        !(self.uses_checkpoint(kind) && self.detection_strategy == DetectionStrategy::Timestamp)
    }
}

impl From<&SyncConfig> for JobConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch.max_size,
            detection_strategy: config.detection_strategy,
            default_conflict_strategy: config.default_conflict_strategy,
            max_parallel_tables: config.max_parallel_tables,
            max_parallel_operations: config.max_parallel_operations,
            require_conflict_resolution: config.require_conflict_resolution,
            modified_column: config.modified_column.clone(),
            change_tracking_enabled: config.change_tracking_enabled,
            retry: config.retry.clone(),
            rollback: config.rollback.clone(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// A persisted sync job. Table tasks, conflicts and records are stored alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub config: JobConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new(kind: JobKind, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Pending,
            config,
            created_at: now,
            updated_at: now,
            rolled_back_at: None,
        }
    }
}
