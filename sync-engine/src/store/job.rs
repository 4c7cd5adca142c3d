use std::collections::HashSet;
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::state::audit::{AuditEvent, SyncErrorRecord};
use crate::state::conflict::{Conflict, ConflictResolution};
use crate::state::job::{JobStatus, SyncJob};
use crate::state::table::{TableProgress, TableStatus, TableSyncTask};
use crate::types::{ConflictId, JobId, PrimaryKey};

/// Trait for storing jobs, their table tasks, conflicts, error records and audit events.
///
/// Implementations must make every single call atomic, counters in particular are only ever
/// modified through [`JobStore::add_table_progress`] so concurrent lanes never lose updates.
pub trait JobStore {
    /// Persists a new job together with one task per table.
    fn insert_job(
        &self,
        job: SyncJob,
        tasks: Vec<TableSyncTask>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    fn get_job(&self, job_id: JobId) -> impl Future<Output = SyncResult<Option<SyncJob>>> + Send;

    /// Returns every job, oldest first.
    fn list_jobs(&self) -> impl Future<Output = SyncResult<Vec<SyncJob>>> + Send;

    /// Overwrites the status of a job. Transitions are validated by the caller.
    fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    fn mark_rolled_back(
        &self,
        job_id: JobId,
        rolled_back_at: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns the tasks of a job in table order.
    fn get_table_tasks(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = SyncResult<Vec<TableSyncTask>>> + Send;

    /// Sets the status of a table task. A `None` start keeps the recorded one, the finish time
    /// is always overwritten.
    fn update_table_status(
        &self,
        job_id: JobId,
        table: &str,
        status: TableStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Adds the given increments to the counters of a table task.
    fn add_table_progress(
        &self,
        job_id: JobId,
        table: &str,
        progress: TableProgress,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Recomputes the conflict count of a table task from its pending conflicts.
    fn refresh_conflict_count(
        &self,
        job_id: JobId,
        table: &str,
    ) -> impl Future<Output = SyncResult<u64>> + Send;

    /// Stores a conflict unless a pending one of the same kind exists for the same table and
    /// key. Returns whether it was stored.
    fn insert_conflict(&self, conflict: Conflict) -> impl Future<Output = SyncResult<bool>> + Send;

    fn get_conflict(
        &self,
        job_id: JobId,
        conflict_id: ConflictId,
    ) -> impl Future<Output = SyncResult<Option<Conflict>>> + Send;

    /// Returns the conflicts of a job in detection order.
    fn list_conflicts(&self, job_id: JobId)
    -> impl Future<Output = SyncResult<Vec<Conflict>>> + Send;

    /// Marks a pending conflict as resolved. Returns `false` when it was not pending anymore.
    fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Returns the keys of a table that have a pending conflict.
    fn pending_conflict_keys(
        &self,
        job_id: JobId,
        table: &str,
    ) -> impl Future<Output = SyncResult<HashSet<PrimaryKey>>> + Send;

    fn insert_error(&self, record: SyncErrorRecord) -> impl Future<Output = SyncResult<()>> + Send;

    fn list_errors(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = SyncResult<Vec<SyncErrorRecord>>> + Send;

    fn insert_audit_event(&self, event: AuditEvent) -> impl Future<Output = SyncResult<()>> + Send;

    fn list_audit_events(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = SyncResult<Vec<AuditEvent>>> + Send;

    /// Returns when detection of the last successful sync of a table started.
    fn get_checkpoint(
        &self,
        table: &str,
    ) -> impl Future<Output = SyncResult<Option<DateTime<Utc>>>> + Send;

    fn set_checkpoint(
        &self,
        table: &str,
        checkpoint: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
