//! The control surface of the engine.
//!
//! [`SyncEngine`] owns the job state machine. Every status change goes through
//! [`JobStatus::transition`] while holding the engine's status lock, so a run finishing and an
//! operator request never race each other into an invalid state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use config::shared::{ConflictStrategy, SyncConfig};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{Instrument, error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::conflict::resolver::{ConflictLocks, ConflictResolver};
use crate::connector::{Connector, Target};
use crate::context::JobContext;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::executor::retry::Backoff;
use crate::ledger::{self, RollbackSummary};
use crate::schema::{SchemaMismatch, load_table_schema, validate_loaded};
use crate::state::audit::{AuditEvent, AuditEventType, SyncErrorRecord};
use crate::state::conflict::{Conflict, ConflictKind, ResolutionRequest, ResolveAllSummary};
use crate::state::job::{JobAction, JobConfig, JobKind, JobStatus, SyncJob};
use crate::state::table::{TableStatus, TableSyncTask};
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::{ConflictId, JobId};
use crate::workers::pool::TableWorkerPool;
use crate::workers::table_sync::TableSyncWorker;

/// Aggregated progress of a job, summed over its tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub tables_total: u64,
    pub tables_processed: u64,
    pub records_total: u64,
    pub records_processed: u64,
}

impl JobProgress {
    fn from_tasks(tasks: &[TableSyncTask]) -> Self {
        tasks.iter().fold(Self::default(), |mut progress, task| {
            progress.tables_total += 1;
            if task.status.is_finished() {
                progress.tables_processed += 1;
            }
            progress.records_total += task.records_total;
            progress.records_processed += task.records_processed;
            progress
        })
    }
}

/// Everything known about a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: SyncJob,
    pub progress: JobProgress,
    pub tables: Vec<TableSyncTask>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<SyncErrorRecord>,
    pub audit: Vec<AuditEvent>,
}

impl JobView {
    pub fn pending_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|conflict| conflict.is_pending())
    }

    pub fn table(&self, table: &str) -> Option<&TableSyncTask> {
        self.tables.iter().find(|task| task.table == table)
    }
}

/// Structural mismatches of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchemaReport {
    pub table: String,
    pub mismatches: Vec<SchemaMismatch>,
}

impl TableSchemaReport {
    pub fn is_compatible(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// A run of a job that is currently executing.
#[derive(Debug)]
struct ActiveRun {
    shutdown_tx: ShutdownTx,
    done_rx: watch::Receiver<bool>,
}

/// Reconciles tables between a source and a target database.
///
/// Cloning is cheap, clones share runs and locks.
#[derive(Debug, Clone)]
pub struct SyncEngine<S, Src, T> {
    config: Arc<SyncConfig>,
    store: S,
    source: Src,
    target: T,
    runs: Arc<Mutex<HashMap<JobId, ActiveRun>>>,
    status_lock: Arc<Mutex<()>>,
    conflict_locks: ConflictLocks,
}

impl<S, Src, T> SyncEngine<S, Src, T>
where
    S: JobStore + LedgerStore + Clone + Send + Sync + 'static,
    Src: Connector + Clone + Send + Sync + 'static,
    T: Target + Clone + Send + Sync + 'static,
{
    pub fn new(config: SyncConfig, store: S, source: Src, target: T) -> Self {
        Self {
            config: Arc::new(config),
            store,
            source,
            target,
            runs: Arc::new(Mutex::new(HashMap::new())),
            status_lock: Arc::new(Mutex::new(())),
            conflict_locks: ConflictLocks::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the job configuration derived from the engine's configuration.
    pub fn default_job_config(&self) -> JobConfig {
        JobConfig::from(self.config.as_ref())
    }

    async fn load_job(&self, job_id: JobId) -> SyncResult<SyncJob> {
        match self.store.get_job(job_id).await? {
            Some(job) => Ok(job),
            None => bail!(
                ErrorKind::JobNotFound,
                "Job not found",
                format!("job {job_id} does not exist")
            ),
        }
    }

    fn context(&self, job: &SyncJob) -> JobContext<S, Src, T> {
        JobContext::new(
            job,
            self.store.clone(),
            self.source.clone(),
            self.target.clone(),
        )
    }

    async fn set_status(
        &self,
        job: &SyncJob,
        next: JobStatus,
        event_type: AuditEventType,
        message: String,
    ) -> SyncResult<JobStatus> {
        let status = job.status.transition(next)?;
        self.store.update_job_status(job.id, status).await?;
        self.store
            .insert_audit_event(AuditEvent::new(job.id, event_type, message))
            .await?;

        info!(job_id = %job.id, from = %job.status, to = %status, "job status changed");

        Ok(status)
    }

    /// Creates a job over `tables` and starts it.
    pub async fn create_job(
        &self,
        kind: JobKind,
        tables: Vec<String>,
        config: JobConfig,
    ) -> SyncResult<SyncJob> {
        config.validate()?;

        if tables.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "A job needs at least one table",
                "the table list is empty"
            );
        }

        let mut seen = HashSet::new();
        for table in &tables {
            if table.trim().is_empty() {
                bail!(
                    ErrorKind::ConfigError,
                    "Table names must not be empty",
                    "the table list contains an empty name"
                );
            }
            if !seen.insert(table.as_str()) {
                bail!(
                    ErrorKind::ConfigError,
                    "Tables must be listed once",
                    format!("table {table} is listed more than once")
                );
            }
        }

        let job = SyncJob::new(kind, config);
        let table_count = tables.len();
        let tasks = tables.iter().map(TableSyncTask::new).collect();
        self.store.insert_job(job.clone(), tasks).await?;
        self.store
            .insert_audit_event(
                AuditEvent::new(
                    job.id,
                    AuditEventType::JobCreated,
                    format!("{kind} job created for {table_count} tables"),
                )
                .with_detail(json!({ "tables": tables })),
            )
            .await?;

        info!(job_id = %job.id, %kind, tables = table_count, "created job");

        self.start_run(job.id, AuditEventType::JobStarted).await?;

        self.load_job(job.id).await
    }

    /// Stops, resumes or deletes a job.
    ///
    /// Stopping signals the running tables and returns right away, the job reaches `stopped`
    /// once in-flight batches are committed.
    pub async fn control_job(&self, job_id: JobId, action: JobAction) -> SyncResult<SyncJob> {
        match action {
            JobAction::Stop => self.stop_job(job_id).await?,
            JobAction::Resume => self.start_run(job_id, AuditEventType::JobResumed).await?,
            JobAction::Delete => self.delete_job(job_id).await?,
        }

        self.load_job(job_id).await
    }

    async fn stop_job(&self, job_id: JobId) -> SyncResult<()> {
        let _status = self.status_lock.lock().await;
        let job = self.load_job(job_id).await?;

        if let Some(run) = self.runs.lock().await.get(&job_id) {
            info!(%job_id, "stop requested");
            run.shutdown_tx.shutdown();
            return Ok(());
        }

        self.set_status(
            &job,
            JobStatus::Stopped,
            AuditEventType::JobStopped,
            "job stopped".to_string(),
        )
        .await?;

        Ok(())
    }

    async fn delete_job(&self, job_id: JobId) -> SyncResult<()> {
        let _status = self.status_lock.lock().await;
        let job = self.load_job(job_id).await?;

        self.set_status(
            &job,
            JobStatus::Deleted,
            AuditEventType::JobDeleted,
            "job deleted".to_string(),
        )
        .await?;

        Ok(())
    }

    /// Moves a job to `running` and spawns its run.
    async fn start_run(&self, job_id: JobId, event_type: AuditEventType) -> SyncResult<()> {
        let _status = self.status_lock.lock().await;
        let job = self.load_job(job_id).await?;

        let mut runs = self.runs.lock().await;
        if runs.contains_key(&job_id) {
            bail!(
                ErrorKind::InvalidState,
                "Job is still running",
                format!("job {job_id} has not finished its current run")
            );
        }

        let message = match event_type {
            AuditEventType::JobResumed => format!("job resumed from {}", job.status),
            _ => "job started".to_string(),
        };
        self.set_status(&job, JobStatus::Running, event_type, message)
            .await?;

        let (shutdown_tx, _) = create_shutdown_channel();
        let (done_tx, done_rx) = watch::channel(false);
        runs.insert(
            job_id,
            ActiveRun {
                shutdown_tx: shutdown_tx.clone(),
                done_rx,
            },
        );

        let engine = self.clone();
        let ctx = self.context(&job);
        let span = tracing::info_span!("job_run", %job_id, kind = %job.kind);
        tokio::spawn(
            async move {
                engine.run_job(ctx, shutdown_tx).await;
                done_tx.send_replace(true);
            }
            .instrument(span),
        );

        Ok(())
    }

    async fn preflight(&self, ctx: &JobContext<S, Src, T>) -> SyncResult<()> {
        for connector in [Preflight::Source(&ctx.source), Preflight::Target(&ctx.target)] {
            let mut backoff = Backoff::new(&ctx.config.retry);
            loop {
                match connector.ping().await {
                    Ok(()) => break,
                    Err(err) => backoff.retry_or_fail(err).await?,
                }
            }
        }

        Ok(())
    }

    /// Executes one run of a job and settles its final status.
    async fn run_job(&self, ctx: JobContext<S, Src, T>, shutdown_tx: ShutdownTx) {
        let job_id = ctx.job_id;

        let result = match self.preflight(&ctx).await {
            Ok(()) => self.run_tables(&ctx, &shutdown_tx).await,
            Err(err) => {
                error!(%job_id, error = %err, "preflight failed");
                Err(err)
            }
        };

        if let Err(err) = self.finalize(&ctx, &shutdown_tx, result).await {
            error!(%job_id, error = %err, "failed to settle the job status");
        }
    }

    async fn run_tables(
        &self,
        ctx: &JobContext<S, Src, T>,
        shutdown_tx: &ShutdownTx,
    ) -> SyncResult<()> {
        let blocked: HashSet<String> = ctx
            .store
            .list_conflicts(ctx.job_id)
            .await?
            .into_iter()
            .filter(|conflict| conflict.is_pending() && conflict.kind == ConflictKind::Schema)
            .map(|conflict| conflict.table)
            .collect();

        let pool = TableWorkerPool::new();
        let permits = Arc::new(Semaphore::new(ctx.config.max_parallel_tables.max(1)));

        for task in ctx.store.get_table_tasks(ctx.job_id).await? {
            if task.status == TableStatus::Completed {
                continue;
            }

            if blocked.contains(&task.table) {
                warn!(table = %task.table, "table has a pending schema conflict, skipping it");
                continue;
            }

            TableSyncWorker::new(
                ctx.clone(),
                task.table,
                shutdown_tx.subscribe(),
                permits.clone(),
                self.conflict_locks.clone(),
            )
            .spawn_into_pool(&pool)
            .await;
        }

        pool.wait_all().await
    }

    /// Settles the status of a job after its run and unregisters the run.
    async fn finalize(
        &self,
        ctx: &JobContext<S, Src, T>,
        shutdown_tx: &ShutdownTx,
        result: SyncResult<()>,
    ) -> SyncResult<()> {
        let _status = self.status_lock.lock().await;
        let job_id = ctx.job_id;

        let settled = self.settle_run(ctx, shutdown_tx, result).await;
        self.runs.lock().await.remove(&job_id);

        settled
    }

    async fn settle_run(
        &self,
        ctx: &JobContext<S, Src, T>,
        shutdown_tx: &ShutdownTx,
        result: SyncResult<()>,
    ) -> SyncResult<()> {
        let job = self.load_job(ctx.job_id).await?;
        let stop_requested = shutdown_tx.is_shutdown();

        let global_error = match result {
            Ok(()) => None,
            Err(err) => {
                ctx.record_error(None, None, &err).await?;
                Some(err)
            }
        };

        // Tables a worker never settled, e.g. after a panic.
        let mut tasks = ctx.store.get_table_tasks(ctx.job_id).await?;
        for task in tasks.iter_mut() {
            let leftover = match task.status {
                TableStatus::Running if stop_requested => TableStatus::Stopped,
                TableStatus::Running => TableStatus::Failed,
                TableStatus::Pending if stop_requested => TableStatus::Stopped,
                _ => continue,
            };

            ctx.store
                .update_table_status(ctx.job_id, &task.table, leftover, None, Some(Utc::now()))
                .await?;
            task.status = leftover;
        }

        if let Some(err) = global_error {
            self.set_status(
                &job,
                JobStatus::Failed,
                AuditEventType::JobFailed,
                format!("job failed: {}", err.summary()),
            )
            .await?;
            return Ok(());
        }

        let all_completed = tasks
            .iter()
            .all(|task| task.status == TableStatus::Completed);

        if stop_requested && !all_completed {
            self.set_status(
                &job,
                JobStatus::Stopped,
                AuditEventType::JobStopped,
                "job stopped".to_string(),
            )
            .await?;
            return Ok(());
        }

        // Any table that did not complete fails the job, resume only re-runs those tables.
        if !all_completed {
            let failed: Vec<&str> = tasks
                .iter()
                .filter(|task| task.status != TableStatus::Completed)
                .map(|task| task.table.as_str())
                .collect();
            self.set_status(
                &job,
                JobStatus::Failed,
                AuditEventType::JobFailed,
                format!("tables did not complete: {}", failed.join(", ")),
            )
            .await?;
            return Ok(());
        }

        let pending = self.pending_conflicts(ctx.job_id).await?;
        if job.config.require_conflict_resolution && pending > 0 {
            info!(
                job_id = %ctx.job_id,
                pending,
                "tables completed, waiting for conflict resolution"
            );
            return Ok(());
        }

        self.set_status(
            &job,
            JobStatus::Completed,
            AuditEventType::JobCompleted,
            "job completed".to_string(),
        )
        .await?;

        Ok(())
    }

    async fn pending_conflicts(&self, job_id: JobId) -> SyncResult<usize> {
        Ok(self
            .store
            .list_conflicts(job_id)
            .await?
            .iter()
            .filter(|conflict| conflict.is_pending())
            .count())
    }

    /// Completes a running job that was only waiting for its conflicts to be resolved.
    async fn complete_if_settled(&self, job_id: JobId) -> SyncResult<()> {
        let _status = self.status_lock.lock().await;

        if self.runs.lock().await.contains_key(&job_id) {
            return Ok(());
        }

        let job = self.load_job(job_id).await?;
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let all_completed = self
            .store
            .get_table_tasks(job_id)
            .await?
            .iter()
            .all(|task| task.status == TableStatus::Completed);
        if !all_completed || self.pending_conflicts(job_id).await? > 0 {
            return Ok(());
        }

        self.set_status(
            &job,
            JobStatus::Completed,
            AuditEventType::JobCompleted,
            "job completed after its conflicts were resolved".to_string(),
        )
        .await?;

        Ok(())
    }

    async fn resolvable_job(&self, job_id: JobId) -> SyncResult<SyncJob> {
        let job = self.load_job(job_id).await?;
        if job.status == JobStatus::Deleted {
            bail!(
                ErrorKind::InvalidState,
                "Conflicts of a deleted job cannot be resolved",
                format!("job {job_id} is deleted")
            );
        }

        Ok(job)
    }

    /// Resolves one conflict of a job.
    pub async fn resolve_conflict(
        &self,
        job_id: JobId,
        conflict_id: ConflictId,
        request: ResolutionRequest,
    ) -> SyncResult<Conflict> {
        let job = self.resolvable_job(job_id).await?;
        let ctx = self.context(&job);

        let conflict = ConflictResolver::new(&ctx, &self.conflict_locks)
            .resolve(conflict_id, &request)
            .await?;

        self.complete_if_settled(job_id).await?;

        Ok(conflict)
    }

    /// Resolves every pending conflict of a job with one strategy.
    pub async fn resolve_all(
        &self,
        job_id: JobId,
        strategy: ConflictStrategy,
        actor: &str,
    ) -> SyncResult<ResolveAllSummary> {
        let job = self.resolvable_job(job_id).await?;
        let ctx = self.context(&job);

        let summary = ConflictResolver::new(&ctx, &self.conflict_locks)
            .resolve_all(strategy, actor)
            .await?;

        self.complete_if_settled(job_id).await?;

        Ok(summary)
    }

    pub async fn get_job(&self, job_id: JobId) -> SyncResult<JobView> {
        let job = self.load_job(job_id).await?;
        let tables = self.store.get_table_tasks(job_id).await?;

        Ok(JobView {
            progress: JobProgress::from_tasks(&tables),
            tables,
            conflicts: self.store.list_conflicts(job_id).await?,
            errors: self.store.list_errors(job_id).await?,
            audit: self.store.list_audit_events(job_id).await?,
            job,
        })
    }

    pub async fn list_jobs(&self) -> SyncResult<Vec<SyncJob>> {
        self.store.list_jobs().await
    }

    /// Compares the current source and target schemas of the job's tables, or of one of them.
    pub async fn get_schema_report(
        &self,
        job_id: JobId,
        table: Option<&str>,
    ) -> SyncResult<Vec<TableSchemaReport>> {
        let job = self.load_job(job_id).await?;
        let tasks = self.store.get_table_tasks(job_id).await?;

        let tables: Vec<String> = match table {
            Some(table) => {
                if !tasks.iter().any(|task| task.table == table) {
                    bail!(
                        ErrorKind::TableNotInJob,
                        "Table is not part of the job",
                        format!("job {job_id} does not sync table {table}")
                    );
                }
                vec![table.to_string()]
            }
            None => tasks.into_iter().map(|task| task.table).collect(),
        };

        let mut reports = Vec::with_capacity(tables.len());
        for table in tables {
            let source = load_table_schema(&self.source, &table, &job.config.retry).await?;
            let target = load_table_schema(&self.target, &table, &job.config.retry).await?;
            let mismatches =
                validate_loaded(&source, &target, job.config.modified_column.as_deref());

            reports.push(TableSchemaReport { table, mismatches });
        }

        Ok(reports)
    }

    /// Reverts the writes a job made at or after `cutoff`.
    pub async fn rollback(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        actor: &str,
    ) -> SyncResult<RollbackSummary> {
        let _status = self.status_lock.lock().await;

        if self.runs.lock().await.contains_key(&job_id) {
            bail!(
                ErrorKind::InvalidState,
                "Job is running",
                format!("job {job_id} must finish before it can be rolled back")
            );
        }

        let job = self.load_job(job_id).await?;
        let ctx = self.context(&job);

        ledger::rollback(&ctx, cutoff, actor).await
    }

    /// Drops ledger entries older than the retention window.
    pub async fn purge_ledger(&self) -> SyncResult<BTreeMap<JobId, u64>> {
        ledger::purge_ledger(&self.store, &self.config.rollback).await
    }

    /// Waits until the current run of a job is over and returns the job.
    pub async fn wait_for_job(&self, job_id: JobId) -> SyncResult<SyncJob> {
        let done_rx = self
            .runs
            .lock()
            .await
            .get(&job_id)
            .map(|run| run.done_rx.clone());

        if let Some(mut done_rx) = done_rx {
            // The sender only goes away once the run is over.
            let _ = done_rx.wait_for(|done| *done).await;
        }

        self.load_job(job_id).await
    }

    /// Returns whether a job currently has a run in progress.
    pub async fn is_running(&self, job_id: JobId) -> bool {
        self.runs.lock().await.contains_key(&job_id)
    }

    /// Restarts jobs that were interrupted by a crash.
    ///
    /// Jobs persisted as `running` without a run in this process pass through `stopped` and are
    /// resumed, `pending` jobs are started.
    pub async fn recover(&self) -> SyncResult<Vec<JobId>> {
        let mut recovered = Vec::new();

        for job in self.store.list_jobs().await? {
            if self.is_running(job.id).await {
                continue;
            }

            match job.status {
                JobStatus::Running => {
                    {
                        let _status = self.status_lock.lock().await;
                        self.set_status(
                            &job,
                            JobStatus::Stopped,
                            AuditEventType::JobStopped,
                            "job interrupted by a restart".to_string(),
                        )
                        .await?;
                    }
                    self.start_run(job.id, AuditEventType::JobResumed).await?;
                }
                JobStatus::Pending => {
                    self.start_run(job.id, AuditEventType::JobStarted).await?;
                }
                _ => continue,
            }

            info!(job_id = %job.id, "recovered job");
            recovered.push(job.id);
        }

        Ok(recovered)
    }

    /// Stops every run and waits for them to settle.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let job_ids: Vec<JobId> = {
            let runs = self.runs.lock().await;
            for run in runs.values() {
                run.shutdown_tx.shutdown();
            }
            runs.keys().copied().collect()
        };

        info!(runs = job_ids.len(), "shutting down engine");

        let mut errors: Vec<SyncError> = Vec::new();
        for job_id in job_ids {
            if let Err(err) = self.wait_for_job(job_id).await {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

/// Either side of a job, for connectivity checks.
enum Preflight<'a, Src, T> {
    Source(&'a Src),
    Target(&'a T),
}

impl<Src, T> Preflight<'_, Src, T>
where
    Src: Connector,
    T: Connector,
{
    async fn ping(&self) -> SyncResult<()> {
        match self {
            Preflight::Source(source) => source.ping().await,
            Preflight::Target(target) => target.ping().await,
        }
    }
}
