use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::{JobId, PrimaryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobStopped,
    JobResumed,
    JobDeleted,
    TableStarted,
    TableCompleted,
    TableFailed,
    TableStopped,
    ConflictDetected,
    ConflictResolved,
    RollbackCompleted,
    LedgerPurged,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::JobCreated => "job_created",
            AuditEventType::JobStarted => "job_started",
            AuditEventType::JobCompleted => "job_completed",
            AuditEventType::JobFailed => "job_failed",
            AuditEventType::JobStopped => "job_stopped",
            AuditEventType::JobResumed => "job_resumed",
            AuditEventType::JobDeleted => "job_deleted",
            AuditEventType::TableStarted => "table_started",
            AuditEventType::TableCompleted => "table_completed",
            AuditEventType::TableFailed => "table_failed",
            AuditEventType::TableStopped => "table_stopped",
            AuditEventType::ConflictDetected => "conflict_detected",
            AuditEventType::ConflictResolved => "conflict_resolved",
            AuditEventType::RollbackCompleted => "rollback_completed",
            AuditEventType::LedgerPurged => "ledger_purged",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "job_created" => AuditEventType::JobCreated,
            "job_started" => AuditEventType::JobStarted,
            "job_completed" => AuditEventType::JobCompleted,
            "job_failed" => AuditEventType::JobFailed,
            "job_stopped" => AuditEventType::JobStopped,
            "job_resumed" => AuditEventType::JobResumed,
            "job_deleted" => AuditEventType::JobDeleted,
            "table_started" => AuditEventType::TableStarted,
            "table_completed" => AuditEventType::TableCompleted,
            "table_failed" => AuditEventType::TableFailed,
            "table_stopped" => AuditEventType::TableStopped,
            "conflict_detected" => AuditEventType::ConflictDetected,
            "conflict_resolved" => AuditEventType::ConflictResolved,
            "rollback_completed" => AuditEventType::RollbackCompleted,
            "ledger_purged" => AuditEventType::LedgerPurged,
            other => return Err(format!("unknown audit event type '{other}'")),
        };

        Ok(event_type)
    }
}

/// Append-only record of something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub job_id: JobId,
    pub table: Option<String>,
    pub event_type: AuditEventType,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(job_id: JobId, event_type: AuditEventType, message: impl Into<String>) -> Self {
        Self {
            job_id,
            table: None,
            event_type,
            message: message.into(),
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_table(
        job_id: JobId,
        table: &str,
        event_type: AuditEventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            table: Some(table.to_string()),
            ..Self::new(job_id, event_type, message)
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// A failure recorded against a job, a table or a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub job_id: JobId,
    pub table: Option<String>,
    pub key: Option<PrimaryKey>,
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SyncErrorRecord {
    pub fn new(
        job_id: JobId,
        table: Option<&str>,
        key: Option<PrimaryKey>,
        error: &SyncError,
    ) -> Self {
        Self {
            job_id,
            table: table.map(ToString::to_string),
            key,
            kind: format!("{:?}", error.kind()),
            message: error.summary(),
            occurred_at: Utc::now(),
        }
    }
}
