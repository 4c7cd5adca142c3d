use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a single table within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Pending => "pending",
            TableStatus::Running => "running",
            TableStatus::Completed => "completed",
            TableStatus::Failed => "failed",
            TableStatus::Stopped => "stopped",
        }
    }

    /// Returns `true` for the states a worker leaves a table in.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TableStatus::Completed | TableStatus::Failed | TableStatus::Stopped
        )
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TableStatus::Pending),
            "running" => Ok(TableStatus::Running),
            "completed" => Ok(TableStatus::Completed),
            "failed" => Ok(TableStatus::Failed),
            "stopped" => Ok(TableStatus::Stopped),
            other => Err(format!("unknown table status '{other}'")),
        }
    }
}

/// Per table subdivision of a job and the unit of parallel scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncTask {
    pub table: String,
    pub status: TableStatus,
    pub records_processed: u64,
    pub records_total: u64,
    /// Number of writes applied to the target.
    pub change_count: u64,
    /// Number of pending conflicts of this table.
    pub conflict_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TableSyncTask {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Pending,
            records_processed: 0,
            records_total: 0,
            change_count: 0,
            conflict_count: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Counter increments applied atomically to a [`TableSyncTask`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableProgress {
    pub records_total: u64,
    pub records_processed: u64,
    pub change_count: u64,
}

impl TableProgress {
    pub fn discovered(count: u64) -> Self {
        Self {
            records_total: count,
            ..Self::default()
        }
    }

    pub fn processed(count: u64, changes: u64) -> Self {
        Self {
            records_processed: count,
            change_count: changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
