use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{ErrorKind, SyncResult};
use crate::state::audit::{AuditEvent, SyncErrorRecord};
use crate::state::conflict::{Conflict, ConflictResolution, ConflictStatus};
use crate::state::job::{JobStatus, SyncJob};
use crate::state::ledger::{LedgerEntry, SyncBaseline};
use crate::state::table::{TableProgress, TableStatus, TableSyncTask};
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::{ConflictId, JobId, PrimaryKey};
use crate::{bail, sync_error};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, SyncJob>,
    /// Tasks of every job in table order.
    tasks: HashMap<JobId, Vec<TableSyncTask>>,
    /// All conflicts in detection order.
    conflicts: Vec<Conflict>,
    errors: Vec<SyncErrorRecord>,
    audit_events: Vec<AuditEvent>,
    checkpoints: HashMap<String, DateTime<Utc>>,
    ledger: Vec<LedgerEntry>,
    next_sequence: u64,
    baselines: HashMap<(String, PrimaryKey), SyncBaseline>,
    purged_before: Option<DateTime<Utc>>,
}

impl Inner {
    fn task_mut(&mut self, job_id: JobId, table: &str) -> SyncResult<&mut TableSyncTask> {
        self.tasks
            .get_mut(&job_id)
            .and_then(|tasks| tasks.iter_mut().find(|task| task.table == table))
            .ok_or_else(|| {
                sync_error!(
                    ErrorKind::TableNotInJob,
                    "Table not found in job",
                    format!("Table '{table}' is not part of job {job_id}")
                )
            })
    }

    fn job_mut(&mut self, job_id: JobId) -> SyncResult<&mut SyncJob> {
        self.jobs.get_mut(&job_id).ok_or_else(|| {
            sync_error!(
                ErrorKind::JobNotFound,
                "Job not found",
                format!("No job with id {job_id}")
            )
        })
    }
}

/// In-memory implementation of [`JobStore`] and [`LedgerStore`].
///
/// Everything lives behind a single async mutex, which makes every call atomic. State is lost
/// when the process exits, so this store is meant for tests and local experiments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    async fn insert_job(&self, job: SyncJob, tasks: Vec<TableSyncTask>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.jobs.contains_key(&job.id) {
            bail!(
                ErrorKind::InvalidState,
                "Job already exists",
                format!("A job with id {} is already stored", job.id)
            );
        }

        inner.tasks.insert(job.id, tasks);
        inner.jobs.insert(job.id, job);

        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> SyncResult<Option<SyncJob>> {
        let inner = self.inner.lock().await;

        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self) -> SyncResult<Vec<SyncJob>> {
        let inner = self.inner.lock().await;

        let mut jobs: Vec<SyncJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));

        Ok(jobs)
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let job = inner.job_mut(job_id)?;
        job.status = status;
        job.updated_at = Utc::now();

        Ok(())
    }

    async fn mark_rolled_back(
        &self,
        job_id: JobId,
        rolled_back_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let job = inner.job_mut(job_id)?;
        job.rolled_back_at = Some(rolled_back_at);
        job.updated_at = rolled_back_at;

        Ok(())
    }

    async fn get_table_tasks(&self, job_id: JobId) -> SyncResult<Vec<TableSyncTask>> {
        let inner = self.inner.lock().await;

        Ok(inner.tasks.get(&job_id).cloned().unwrap_or_default())
    }

    async fn update_table_status(
        &self,
        job_id: JobId,
        table: &str,
        status: TableStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let task = inner.task_mut(job_id, table)?;
        task.status = status;
        if started_at.is_some() {
            task.started_at = started_at;
        }
        task.finished_at = finished_at;

        Ok(())
    }

    async fn add_table_progress(
        &self,
        job_id: JobId,
        table: &str,
        progress: TableProgress,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        let task = inner.task_mut(job_id, table)?;
        task.records_total += progress.records_total;
        task.records_processed += progress.records_processed;
        task.change_count += progress.change_count;

        Ok(())
    }

    async fn refresh_conflict_count(&self, job_id: JobId, table: &str) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;

        let count = inner
            .conflicts
            .iter()
            .filter(|conflict| {
                conflict.job_id == job_id && conflict.table == table && conflict.is_pending()
            })
            .count() as u64;
        inner.task_mut(job_id, table)?.conflict_count = count;

        Ok(count)
    }

    async fn insert_conflict(&self, conflict: Conflict) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        let duplicate = inner.conflicts.iter().any(|existing| {
            existing.is_pending()
                && existing.job_id == conflict.job_id
                && existing.table == conflict.table
                && existing.kind == conflict.kind
                && existing.key == conflict.key
        });
        if duplicate {
            return Ok(false);
        }

        inner.conflicts.push(conflict);

        Ok(true)
    }

    async fn get_conflict(
        &self,
        job_id: JobId,
        conflict_id: ConflictId,
    ) -> SyncResult<Option<Conflict>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .conflicts
            .iter()
            .find(|conflict| conflict.job_id == job_id && conflict.id == conflict_id)
            .cloned())
    }

    async fn list_conflicts(&self, job_id: JobId) -> SyncResult<Vec<Conflict>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .conflicts
            .iter()
            .filter(|conflict| conflict.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(conflict) = inner
            .conflicts
            .iter_mut()
            .find(|conflict| conflict.id == conflict_id && conflict.is_pending())
        else {
            return Ok(false);
        };

        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution.strategy);
        conflict.resolved_value = resolution.resolved_value;
        conflict.resolved_by = Some(resolution.resolved_by);
        conflict.resolved_at = Some(resolution.resolved_at);

        Ok(true)
    }

    async fn pending_conflict_keys(
        &self,
        job_id: JobId,
        table: &str,
    ) -> SyncResult<HashSet<PrimaryKey>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .conflicts
            .iter()
            .filter(|conflict| {
                conflict.job_id == job_id && conflict.table == table && conflict.is_pending()
            })
            .filter_map(|conflict| conflict.key.clone())
            .collect())
    }

    async fn insert_error(&self, record: SyncErrorRecord) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.errors.push(record);

        Ok(())
    }

    async fn list_errors(&self, job_id: JobId) -> SyncResult<Vec<SyncErrorRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .errors
            .iter()
            .filter(|record| record.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn insert_audit_event(&self, event: AuditEvent) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.audit_events.push(event);

        Ok(())
    }

    async fn list_audit_events(&self, job_id: JobId) -> SyncResult<Vec<AuditEvent>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .audit_events
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;

        Ok(inner.checkpoints.get(table).copied())
    }

    async fn set_checkpoint(&self, table: &str, checkpoint: DateTime<Utc>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.insert(table.to_string(), checkpoint);

        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    async fn append_entries(&self, entries: Vec<LedgerEntry>) -> SyncResult<Vec<LedgerEntry>> {
        let mut inner = self.inner.lock().await;

        let mut appended = Vec::with_capacity(entries.len());
        for mut entry in entries {
            inner.next_sequence += 1;
            entry.sequence = inner.next_sequence;

            let baseline_key = (entry.table.clone(), entry.key.clone());
            match &entry.baseline {
                Some(baseline) => {
                    inner.baselines.insert(baseline_key, baseline.clone());
                }
                None => {
                    inner.baselines.remove(&baseline_key);
                }
            }

            inner.ledger.push(entry.clone());
            appended.push(entry);
        }

        Ok(appended)
    }

    async fn entries_for_job(&self, job_id: JobId) -> SyncResult<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .ledger
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SyncResult<BTreeMap<JobId, u64>> {
        let mut inner = self.inner.lock().await;

        let mut purged = BTreeMap::new();
        inner.ledger.retain(|entry| {
            if entry.applied_at < cutoff {
                *purged.entry(entry.job_id).or_insert(0) += 1;
                false
            } else {
                true
            }
        });
        inner.purged_before = inner.purged_before.max(Some(cutoff));

        Ok(purged)
    }

    async fn purged_before(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;

        Ok(inner.purged_before)
    }

    async fn get_baselines(
        &self,
        table: &str,
        keys: &[PrimaryKey],
    ) -> SyncResult<HashMap<PrimaryKey, SyncBaseline>> {
        let inner = self.inner.lock().await;

        let mut baselines = HashMap::new();
        for key in keys {
            if let Some(baseline) = inner.baselines.get(&(table.to_string(), key.clone())) {
                baselines.insert(key.clone(), baseline.clone());
            }
        }

        Ok(baselines)
    }

    async fn put_baselines(
        &self,
        table: &str,
        baselines: Vec<(PrimaryKey, SyncBaseline)>,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        for (key, baseline) in baselines {
            inner.baselines.insert((table.to_string(), key), baseline);
        }

        Ok(())
    }
}
