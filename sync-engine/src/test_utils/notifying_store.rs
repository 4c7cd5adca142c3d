use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};

use crate::error::SyncResult;
use crate::state::audit::{AuditEvent, SyncErrorRecord};
use crate::state::conflict::{Conflict, ConflictResolution};
use crate::state::job::{JobStatus, SyncJob};
use crate::state::ledger::{LedgerEntry, SyncBaseline};
use crate::state::table::{TableProgress, TableStatus, TableSyncTask};
use crate::store::both::memory::MemoryStore;
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::test_utils::notify::TimedNotify;
use crate::types::{ConflictId, JobId, PrimaryKey};

type TableStatusCondition = (JobId, String, TableStatus, Arc<Notify>);
type JobStatusCondition = (JobId, JobStatus, Arc<Notify>);

#[derive(Default)]
struct Inner {
    table_statuses: HashMap<(JobId, String), TableStatus>,
    /// Every status a table went through, in order.
    table_status_history: HashMap<(JobId, String), Vec<TableStatus>>,
    job_statuses: HashMap<JobId, JobStatus>,
    table_status_conditions: Vec<TableStatusCondition>,
    job_status_conditions: Vec<JobStatusCondition>,
    conflict_notifiers: Vec<(JobId, Arc<Notify>)>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let table_statuses = &self.table_statuses;
        self.table_status_conditions
            .retain(|(job_id, table, expected, notify)| {
                let reached =
                    table_statuses.get(&(*job_id, table.clone())) == Some(expected);
                if reached {
                    notify.notify_one();
                }
                !reached
            });

        let job_statuses = &self.job_statuses;
        self.job_status_conditions
            .retain(|(job_id, expected, notify)| {
                let reached = job_statuses.get(job_id) == Some(expected);
                if reached {
                    notify.notify_one();
                }
                !reached
            });
    }
}

/// A [`MemoryStore`] that wakes up tests once tables or jobs reach a status.
///
/// Notifications use [`Notify::notify_one`], so a condition reached before the test awaits the
/// returned [`TimedNotify`] is not lost.
#[derive(Clone, Default)]
pub struct NotifyingStore {
    store: MemoryStore,
    inner: Arc<RwLock<Inner>>,
}

impl NotifyingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a notification fired once `table` of `job_id` is in `status`.
    pub async fn notify_on_table_status(
        &self,
        job_id: JobId,
        table: &str,
        status: TableStatus,
    ) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner.table_status_conditions.push((
            job_id,
            table.to_string(),
            status,
            notify.clone(),
        ));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Returns a notification fired once job `job_id` is in `status`.
    pub async fn notify_on_job_status(&self, job_id: JobId, status: JobStatus) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner
            .job_status_conditions
            .push((job_id, status, notify.clone()));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Returns a notification fired every time a new conflict of `job_id` is recorded.
    pub async fn notify_on_conflict(&self, job_id: JobId) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;
        inner.conflict_notifiers.push((job_id, notify.clone()));

        TimedNotify::new(notify)
    }

    /// Returns the statuses `table` of `job_id` went through.
    pub async fn table_status_history(&self, job_id: JobId, table: &str) -> Vec<TableStatus> {
        let inner = self.inner.read().await;
        inner
            .table_status_history
            .get(&(job_id, table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn record_table_status(&self, job_id: JobId, table: &str, status: TableStatus) {
        let mut inner = self.inner.write().await;
        let key = (job_id, table.to_string());
        inner
            .table_status_history
            .entry(key.clone())
            .or_default()
            .push(status);
        inner.table_statuses.insert(key, status);
        inner.check_conditions();
    }

    async fn record_job_status(&self, job_id: JobId, status: JobStatus) {
        let mut inner = self.inner.write().await;
        inner.job_statuses.insert(job_id, status);
        inner.check_conditions();
    }
}

impl fmt::Debug for NotifyingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingStore").finish()
    }
}

impl JobStore for NotifyingStore {
    async fn insert_job(&self, job: SyncJob, tasks: Vec<TableSyncTask>) -> SyncResult<()> {
        let (job_id, status) = (job.id, job.status);
        let initial: Vec<(String, TableStatus)> = tasks
            .iter()
            .map(|task| (task.table.clone(), task.status))
            .collect();

        self.store.insert_job(job, tasks).await?;

        self.record_job_status(job_id, status).await;
        for (table, status) in initial {
            self.record_table_status(job_id, &table, status).await;
        }

        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> SyncResult<Option<SyncJob>> {
        self.store.get_job(job_id).await
    }

    async fn list_jobs(&self) -> SyncResult<Vec<SyncJob>> {
        self.store.list_jobs().await
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> SyncResult<()> {
        self.store.update_job_status(job_id, status).await?;
        self.record_job_status(job_id, status).await;

        Ok(())
    }

    async fn mark_rolled_back(
        &self,
        job_id: JobId,
        rolled_back_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.store.mark_rolled_back(job_id, rolled_back_at).await
    }

    async fn get_table_tasks(&self, job_id: JobId) -> SyncResult<Vec<TableSyncTask>> {
        self.store.get_table_tasks(job_id).await
    }

    async fn update_table_status(
        &self,
        job_id: JobId,
        table: &str,
        status: TableStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        self.store
            .update_table_status(job_id, table, status, started_at, finished_at)
            .await?;
        self.record_table_status(job_id, table, status).await;

        Ok(())
    }

    async fn add_table_progress(
        &self,
        job_id: JobId,
        table: &str,
        progress: TableProgress,
    ) -> SyncResult<()> {
        self.store.add_table_progress(job_id, table, progress).await
    }

    async fn refresh_conflict_count(&self, job_id: JobId, table: &str) -> SyncResult<u64> {
        self.store.refresh_conflict_count(job_id, table).await
    }

    async fn insert_conflict(&self, conflict: Conflict) -> SyncResult<bool> {
        let job_id = conflict.job_id;
        let inserted = self.store.insert_conflict(conflict).await?;

        if inserted {
            let inner = self.inner.read().await;
            for (_, notify) in inner
                .conflict_notifiers
                .iter()
                .filter(|(notified_job, _)| *notified_job == job_id)
            {
                notify.notify_one();
            }
        }

        Ok(inserted)
    }

    async fn get_conflict(
        &self,
        job_id: JobId,
        conflict_id: ConflictId,
    ) -> SyncResult<Option<Conflict>> {
        self.store.get_conflict(job_id, conflict_id).await
    }

    async fn list_conflicts(&self, job_id: JobId) -> SyncResult<Vec<Conflict>> {
        self.store.list_conflicts(job_id).await
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> SyncResult<bool> {
        self.store.resolve_conflict(conflict_id, resolution).await
    }

    async fn pending_conflict_keys(
        &self,
        job_id: JobId,
        table: &str,
    ) -> SyncResult<HashSet<PrimaryKey>> {
        self.store.pending_conflict_keys(job_id, table).await
    }

    async fn insert_error(&self, record: SyncErrorRecord) -> SyncResult<()> {
        self.store.insert_error(record).await
    }

    async fn list_errors(&self, job_id: JobId) -> SyncResult<Vec<SyncErrorRecord>> {
        self.store.list_errors(job_id).await
    }

    async fn insert_audit_event(&self, event: AuditEvent) -> SyncResult<()> {
        self.store.insert_audit_event(event).await
    }

    async fn list_audit_events(&self, job_id: JobId) -> SyncResult<Vec<AuditEvent>> {
        self.store.list_audit_events(job_id).await
    }

    async fn get_checkpoint(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.store.get_checkpoint(table).await
    }

    async fn set_checkpoint(&self, table: &str, checkpoint: DateTime<Utc>) -> SyncResult<()> {
        self.store.set_checkpoint(table, checkpoint).await
    }
}

impl LedgerStore for NotifyingStore {
    async fn append_entries(&self, entries: Vec<LedgerEntry>) -> SyncResult<Vec<LedgerEntry>> {
        self.store.append_entries(entries).await
    }

    async fn entries_for_job(&self, job_id: JobId) -> SyncResult<Vec<LedgerEntry>> {
        self.store.entries_for_job(job_id).await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SyncResult<BTreeMap<JobId, u64>> {
        self.store.purge_before(cutoff).await
    }

    async fn purged_before(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.store.purged_before().await
    }

    async fn get_baselines(
        &self,
        table: &str,
        keys: &[PrimaryKey],
    ) -> SyncResult<HashMap<PrimaryKey, SyncBaseline>> {
        self.store.get_baselines(table, keys).await
    }

    async fn put_baselines(
        &self,
        table: &str,
        baselines: Vec<(PrimaryKey, SyncBaseline)>,
    ) -> SyncResult<()> {
        self.store.put_baselines(table, baselines).await
    }
}
