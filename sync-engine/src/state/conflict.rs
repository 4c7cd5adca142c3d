use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use config::shared::ConflictStrategy;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::schema::SchemaMismatch;
use crate::types::{ConflictId, JobId, PrimaryKey, RowImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed a row independently since the baseline.
    Data,
    /// Source and target tables are structurally incompatible.
    Schema,
    /// The target rejected a write.
    Constraint,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Data => "data",
            ConflictKind::Schema => "schema",
            ConflictKind::Constraint => "constraint",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(ConflictKind::Data),
            "schema" => Ok(ConflictKind::Schema),
            "constraint" => Ok(ConflictKind::Constraint),
            other => Err(format!("unknown conflict kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            other => Err(format!("unknown conflict status '{other}'")),
        }
    }
}

/// A divergence that needs a decision before the row, or table, can be synced.
///
/// Conflicts are never deleted, resolving one only records how it was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub job_id: JobId,
    pub table: String,
    /// Absent for schema conflicts.
    pub key: Option<PrimaryKey>,
    pub kind: ConflictKind,
    pub status: ConflictStatus,
    pub source_value: Option<RowImage>,
    pub target_value: Option<RowImage>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub target_modified_at: Option<DateTime<Utc>>,
    pub description: String,
    pub schema_mismatches: Vec<SchemaMismatch>,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<ConflictStrategy>,
    pub resolved_value: Option<RowImage>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn new(
        job_id: JobId,
        table: impl Into<String>,
        key: Option<PrimaryKey>,
        kind: ConflictKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            job_id,
            table: table.into(),
            key,
            kind,
            status: ConflictStatus::Pending,
            source_value: None,
            target_value: None,
            source_modified_at: None,
            target_modified_at: None,
            description: description.into(),
            schema_mismatches: Vec::new(),
            detected_at: Utc::now(),
            resolution: None,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Creates the conflict that suspends a table with an incompatible structure.
    pub fn schema(job_id: JobId, table: &str, mismatches: Vec<SchemaMismatch>) -> Self {
        let description = mismatches
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            schema_mismatches: mismatches,
            ..Self::new(job_id, table, None, ConflictKind::Schema, description)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub resolved_value: Option<RowImage>,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// A request to settle one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionRequest {
    pub strategy: ConflictStrategy,
    /// Replacement row image, required by [`ConflictStrategy::Manual`].
    pub manual_value: Option<RowImage>,
    pub actor: String,
}

impl ResolutionRequest {
    pub fn new(strategy: ConflictStrategy, actor: impl Into<String>) -> Self {
        Self {
            strategy,
            manual_value: None,
            actor: actor.into(),
        }
    }

    pub fn manual(value: RowImage, actor: impl Into<String>) -> Self {
        Self {
            strategy: ConflictStrategy::Manual,
            manual_value: Some(value),
            actor: actor.into(),
        }
    }
}

/// Outcome of resolving every pending conflict of a job.
#[derive(Debug, Default)]
pub struct ResolveAllSummary {
    pub resolved: usize,
    /// Conflicts that were resolved concurrently.
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<(ConflictId, SyncError)>,
}
