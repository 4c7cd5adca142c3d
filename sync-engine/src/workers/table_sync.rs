use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::conflict::classifier::classify_batch;
use crate::conflict::resolver::{ConflictLocks, ConflictResolver};
use crate::connector::{Connector, ModifiedFilter, Target};
use crate::context::JobContext;
use crate::detection::{ChangeDetector, DetectedBatch, DetectionOptions};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::executor::batch::BatchExecutor;
use crate::executor::retry::Backoff;
use crate::schema::{load_table_schema, validate_loaded};
use crate::state::audit::{AuditEvent, AuditEventType};
use crate::state::conflict::Conflict;
use crate::state::table::{TableProgress, TableStatus};
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::PrimaryKey;
use crate::workers::pool::TableWorkerPool;

/// How a table run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableSyncResult {
    Completed,
    Stopped,
}

/// Counters of one table run, reported in its final audit event.
#[derive(Debug, Default)]
struct RunStats {
    scanned: u64,
    applied: u64,
    conflicts: u64,
    held: u64,
    failed_rows: u64,
}

/// Synchronizes one table of a job run: validates its schema, then detects, classifies and
/// applies its changes batch by batch.
#[derive(Debug)]
pub struct TableSyncWorker<S, Src, T> {
    ctx: JobContext<S, Src, T>,
    table: String,
    shutdown_rx: ShutdownRx,
    run_permit: Arc<Semaphore>,
    locks: ConflictLocks,
}

impl<S, Src, T> TableSyncWorker<S, Src, T>
where
    S: JobStore + LedgerStore + Clone + Send + Sync + 'static,
    Src: Connector + Clone + Send + Sync + 'static,
    T: Target + Clone + Send + Sync + 'static,
{
    pub fn new(
        ctx: JobContext<S, Src, T>,
        table: String,
        shutdown_rx: ShutdownRx,
        run_permit: Arc<Semaphore>,
        locks: ConflictLocks,
    ) -> Self {
        Self {
            ctx,
            table,
            shutdown_rx,
            run_permit,
            locks,
        }
    }

    pub async fn spawn_into_pool(self, pool: &TableWorkerPool) {
        let span = tracing::info_span!(
            "table_sync_worker",
            job_id = %self.ctx.job_id,
            table = %self.table,
        );
        let table = self.table.clone();

        pool.lock()
            .await
            .spawn(table, self.run().instrument(span));
    }

    /// Runs the table and persists its final state. Only failures to persist are returned.
    async fn run(mut self) -> SyncResult<()> {
        debug!("waiting for a run permit");

        let permit = tokio::select! {
            biased;

            _ = self.shutdown_rx.wait() => None,

            permit = self.run_permit.clone().acquire_owned() => Some(permit),
        };

        let permit = match permit {
            Some(Ok(permit)) => permit,
            Some(Err(err)) => bail!(ErrorKind::InvalidState, "Run permits were closed", err),
            None => {
                info!("stop requested before the table started");
                return self
                    .finish(Ok(TableSyncResult::Stopped), RunStats::default())
                    .await;
            }
        };

        self.ctx
            .store
            .update_table_status(
                self.ctx.job_id,
                &self.table,
                TableStatus::Running,
                Some(Utc::now()),
                None,
            )
            .await?;
        self.ctx
            .audit(AuditEvent::for_table(
                self.ctx.job_id,
                &self.table,
                AuditEventType::TableStarted,
                format!("started syncing table {}", self.table),
            ))
            .await?;

        let mut stats = RunStats::default();
        let result = self.sync_table(&mut stats).await;

        drop(permit);

        self.finish(result, stats).await
    }

    async fn finish(
        &self,
        result: SyncResult<TableSyncResult>,
        stats: RunStats,
    ) -> SyncResult<()> {
        let detail = json!({
            "scanned": stats.scanned,
            "applied": stats.applied,
            "conflicts": stats.conflicts,
            "held": stats.held,
            "failed_rows": stats.failed_rows,
        });

        let (status, event_type, message) = match result {
            Ok(TableSyncResult::Completed) => {
                info!(applied = stats.applied, conflicts = stats.conflicts, "table completed");
                (
                    TableStatus::Completed,
                    AuditEventType::TableCompleted,
                    format!("table {} completed", self.table),
                )
            }
            Ok(TableSyncResult::Stopped) => {
                info!(applied = stats.applied, "table stopped");
                (
                    TableStatus::Stopped,
                    AuditEventType::TableStopped,
                    format!("table {} stopped", self.table),
                )
            }
            Err(err) => {
                error!(error = %err, "table failed");
                self.ctx.record_error(Some(&self.table), None, &err).await?;
                (
                    TableStatus::Failed,
                    AuditEventType::TableFailed,
                    format!("table {} failed: {}", self.table, err.summary()),
                )
            }
        };

        self.ctx
            .store
            .update_table_status(self.ctx.job_id, &self.table, status, None, Some(Utc::now()))
            .await?;
        self.ctx
            .audit(
                AuditEvent::for_table(self.ctx.job_id, &self.table, event_type, message)
                    .with_detail(detail),
            )
            .await?;

        Ok(())
    }

    /// Fails with [`ErrorKind::SchemaConflict`] after recording a schema conflict when the two
    /// sides are not compatible. Returns the source value columns otherwise.
    async fn check_schema(&self) -> SyncResult<Vec<String>> {
        let retry = &self.ctx.config.retry;
        let source = load_table_schema(&self.ctx.source, &self.table, retry).await?;
        let target = load_table_schema(&self.ctx.target, &self.table, retry).await?;

        let mismatches =
            validate_loaded(&source, &target, self.ctx.config.modified_column.as_deref());

        if mismatches.is_empty() {
            if let Ok(source) = source {
                return Ok(source.value_columns());
            }
        }

        let conflict = Conflict::schema(self.ctx.job_id, &self.table, mismatches);
        let description = conflict.description.clone();
        if self.ctx.store.insert_conflict(conflict.clone()).await? {
            self.audit_conflict(&conflict).await?;
        }
        self.ctx
            .store
            .refresh_conflict_count(self.ctx.job_id, &self.table)
            .await?;

        bail!(
            ErrorKind::SchemaConflict,
            "Source and target schemas are incompatible",
            description
        );
    }

    async fn audit_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        self.ctx
            .audit(
                AuditEvent::for_table(
                    self.ctx.job_id,
                    &self.table,
                    AuditEventType::ConflictDetected,
                    format!("{} conflict detected: {}", conflict.kind, conflict.description),
                )
                .with_detail(json!({
                    "conflict_id": conflict.id.to_string(),
                    "kind": conflict.kind.as_str(),
                    "key": conflict.key.as_ref().map(|key| key.key_text()),
                })),
            )
            .await
    }

    async fn detection_options(
        &self,
        value_columns: Vec<String>,
    ) -> SyncResult<DetectionOptions> {
        let config = &self.ctx.config;

        let modified_filter = match &config.modified_column {
            Some(column) if config.uses_checkpoint(self.ctx.kind) => self
                .ctx
                .store
                .get_checkpoint(&self.table)
                .await?
                .map(|since| ModifiedFilter {
                    column: column.clone(),
                    since,
                }),
            _ => None,
        };

        if let Some(filter) = &modified_filter {
            info!(since = %filter.since, "scanning rows modified since the last checkpoint");
        }

        Ok(DetectionOptions {
            table: self.table.clone(),
            value_columns,
            modified_column: config.modified_column.clone(),
            batch_size: config.batch_size,
            modified_filter,
            detect_deletes: config.detects_deletes(self.ctx.kind),
        })
    }

    async fn sync_table(&self, stats: &mut RunStats) -> SyncResult<TableSyncResult> {
        let value_columns = self.check_schema().await?;

        let detection_started_at = Utc::now();
        let options = self.detection_options(value_columns).await?;
        let mut detector =
            ChangeDetector::new(options, &self.ctx.source, &self.ctx.target, &self.ctx.store);
        let executor = BatchExecutor::new(&self.ctx, &self.table, &self.shutdown_rx);
        let resolver = ConflictResolver::new(&self.ctx, &self.locks);

        loop {
            if self.shutdown_rx.is_shutdown() {
                return Ok(TableSyncResult::Stopped);
            }

            let Some(batch) = self.next_batch(&mut detector).await? else {
                break;
            };

            let stopped = self.process_batch(batch, &executor, &resolver, stats).await?;
            if stopped {
                return Ok(TableSyncResult::Stopped);
            }
        }

        self.advance_checkpoint(detection_started_at, stats).await?;

        Ok(TableSyncResult::Completed)
    }

    async fn next_batch(
        &self,
        detector: &mut ChangeDetector<'_, Src, T, S>,
    ) -> SyncResult<Option<DetectedBatch>> {
        let mut backoff = Backoff::new(&self.ctx.config.retry);

        loop {
            match detector.next_batch().await {
                Ok(batch) => return Ok(batch),
                Err(err) => backoff.retry_or_fail(err).await?,
            }
        }
    }

    /// Classifies and applies one detected batch. Returns whether a stop interrupted it.
    async fn process_batch(
        &self,
        batch: DetectedBatch,
        executor: &BatchExecutor<'_, S, Src, T>,
        resolver: &ConflictResolver<'_, S, Src, T>,
        stats: &mut RunStats,
    ) -> SyncResult<bool> {
        let job_id = self.ctx.job_id;
        stats.scanned += batch.scanned as u64;

        if !batch.settled.is_empty() {
            self.ctx.store.put_baselines(&self.table, batch.settled).await?;
        }

        let pending_keys = self.ctx.store.pending_conflict_keys(job_id, &self.table).await?;
        let classified = classify_batch(job_id, batch.operations, &pending_keys);
        stats.held += classified.held as u64;

        let no_ops = classified.settled.len() as u64;
        if !classified.settled.is_empty() {
            self.ctx
                .store
                .put_baselines(&self.table, classified.settled)
                .await?;
        }

        let mut detected = Vec::new();
        for conflict in classified.conflicts {
            if self.ctx.store.insert_conflict(conflict.clone()).await? {
                self.audit_conflict(&conflict).await?;
                detected.push(conflict);
            }
        }

        let discovered = classified.clean.len() as u64 + no_ops + detected.len() as u64;
        if discovered > 0 {
            self.ctx
                .store
                .add_table_progress(
                    job_id,
                    &self.table,
                    TableProgress {
                        records_total: discovered,
                        records_processed: no_ops,
                        change_count: 0,
                    },
                )
                .await?;
        }

        let outcome = executor.execute(classified.clean).await?;
        stats.applied += outcome.applied;

        for conflict in outcome.conflicts {
            if self.ctx.store.insert_conflict(conflict.clone()).await? {
                self.audit_conflict(&conflict).await?;
                detected.push(conflict);
            }
        }

        for (key, err) in &outcome.failures {
            self.record_row_error(key.clone(), err).await?;
        }
        stats.failed_rows += outcome.failures.len() as u64;
        stats.conflicts += detected.len() as u64;

        if !detected.is_empty() {
            resolver.auto_resolve(&detected).await?;
        }

        self.ctx
            .store
            .refresh_conflict_count(job_id, &self.table)
            .await?;

        Ok(outcome.stopped)
    }

    async fn record_row_error(
        &self,
        key: PrimaryKey,
        err: &SyncError,
    ) -> SyncResult<()> {
        self.ctx.record_error(Some(&self.table), Some(key), err).await
    }

    /// Moves the checkpoint of the table to the start of this detection.
    ///
    /// The checkpoint stays put when rows were skipped, so the next incremental run sees them
    /// again.
    async fn advance_checkpoint(
        &self,
        detection_started_at: DateTime<Utc>,
        stats: &RunStats,
    ) -> SyncResult<()> {
        if !self.ctx.config.change_tracking_enabled {
            return Ok(());
        }

        if stats.failed_rows > 0 || stats.held > 0 {
            debug!(
                failed_rows = stats.failed_rows,
                held = stats.held,
                "not advancing the checkpoint"
            );
            return Ok(());
        }

        self.ctx
            .store
            .set_checkpoint(&self.table, detection_started_at)
            .await
    }
}
