use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Fingerprint, JobId, PrimaryKey, RowImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(format!("unknown change kind '{other}'")),
        }
    }
}

/// What caused a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOrigin {
    Sync,
    Resolution,
    Rollback,
}

impl LedgerOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOrigin::Sync => "sync",
            LedgerOrigin::Resolution => "resolution",
            LedgerOrigin::Rollback => "rollback",
        }
    }
}

impl FromStr for LedgerOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(LedgerOrigin::Sync),
            "resolution" => Ok(LedgerOrigin::Resolution),
            "rollback" => Ok(LedgerOrigin::Rollback),
            other => Err(format!("unknown ledger origin '{other}'")),
        }
    }
}

/// Fingerprints of both sides of a row agreed at its last reconciliation.
///
/// A missing half means the row did not exist on that side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncBaseline {
    pub source: Option<Fingerprint>,
    pub target: Option<Fingerprint>,
}

impl SyncBaseline {
    pub fn new(source: Option<Fingerprint>, target: Option<Fingerprint>) -> Self {
        Self { source, target }
    }

    /// Baseline of a row whose sides are identical.
    pub fn settled(fingerprint: Fingerprint) -> Self {
        Self {
            source: Some(fingerprint.clone()),
            target: Some(fingerprint),
        }
    }
}

/// One committed write to the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Assigned by the store on append, zero before.
    pub sequence: u64,
    pub job_id: JobId,
    pub table: String,
    pub key: PrimaryKey,
    pub operation: ChangeKind,
    /// Target image before the write, absent for inserts.
    pub previous: Option<RowImage>,
    /// Target image after the write, absent for deletes.
    pub new: Option<RowImage>,
    /// Baseline of the key before the write.
    pub previous_baseline: Option<SyncBaseline>,
    /// Baseline of the key after the write. `None` removes it.
    pub baseline: Option<SyncBaseline>,
    pub origin: LedgerOrigin,
    pub actor: String,
    pub applied_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Builds the entry that undoes this one.
    pub fn reversal(&self, actor: &str, applied_at: DateTime<Utc>) -> Self {
        let operation = match self.operation {
            ChangeKind::Insert => ChangeKind::Delete,
            ChangeKind::Update => ChangeKind::Update,
            ChangeKind::Delete => ChangeKind::Insert,
        };

        Self {
            sequence: 0,
            job_id: self.job_id,
            table: self.table.clone(),
            key: self.key.clone(),
            operation,
            previous: self.new.clone(),
            new: self.previous.clone(),
            previous_baseline: self.baseline.clone(),
            baseline: self.previous_baseline.clone(),
            origin: LedgerOrigin::Rollback,
            actor: actor.to_string(),
            applied_at,
        }
    }
}
