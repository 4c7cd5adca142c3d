use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::connector::{RowWrite, Target};
use crate::context::{ENGINE_ACTOR, JobContext};
use crate::detection::ChangeOperation;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::executor::write::{WriteContext, append_ledger, apply_writes, ledger_entry};
use crate::state::conflict::{Conflict, ConflictKind};
use crate::state::ledger::{LedgerOrigin, SyncBaseline};
use crate::state::table::TableProgress;
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::sync_error;
use crate::types::{PrimaryKey, TableRow};

/// Result of executing the clean changes of one detection batch.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Number of committed writes.
    pub applied: u64,
    /// Rows the target rejected.
    pub conflicts: Vec<Conflict>,
    /// Rows skipped after a non-transient failure.
    pub failures: Vec<(PrimaryKey, SyncError)>,
    /// Whether a stop prevented some chunks from starting.
    pub stopped: bool,
}

impl ExecutionOutcome {
    fn merge(&mut self, other: ExecutionOutcome) {
        self.applied += other.applied;
        self.conflicts.extend(other.conflicts);
        self.failures.extend(other.failures);
        self.stopped |= other.stopped;
    }
}

/// Splits operations into lanes so that all changes of a key land in the same lane in
/// detection order.
fn partition(operations: Vec<ChangeOperation>, lanes: usize) -> Vec<Vec<ChangeOperation>> {
    let lanes = lanes.max(1);
    let mut partitioned: Vec<Vec<ChangeOperation>> = (0..lanes).map(|_| Vec::new()).collect();

    for operation in operations {
        let mut hasher = DefaultHasher::new();
        operation.key.hash(&mut hasher);
        let lane = (hasher.finish() % lanes as u64) as usize;
        partitioned[lane].push(operation);
    }

    partitioned.retain(|lane| !lane.is_empty());
    partitioned
}

fn to_write(operation: &ChangeOperation) -> RowWrite {
    match &operation.source {
        Some(source) => RowWrite::Upsert(TableRow::new(operation.key.clone(), source.image.clone())),
        None => RowWrite::Delete(operation.key.clone()),
    }
}

fn constraint_conflict(
    job_id: crate::types::JobId,
    operation: &ChangeOperation,
    error: &SyncError,
) -> Conflict {
    let mut conflict = Conflict::new(
        job_id,
        &operation.table,
        Some(operation.key.clone()),
        ConflictKind::Constraint,
        error.summary(),
    );
    conflict.source_value = operation.source.as_ref().map(|state| state.image.clone());
    conflict.target_value = operation.target.as_ref().map(|state| state.image.clone());
    conflict.source_modified_at = operation.source.as_ref().and_then(|state| state.modified_at);
    conflict.target_modified_at = operation.target.as_ref().and_then(|state| state.modified_at);

    conflict
}

/// Applies the clean changes of a table in atomic chunks.
///
/// Changes run in `max_parallel_operations` lanes joined in the calling task. Every committed
/// chunk appends its ledger entries before its rows are counted as processed. A failed chunk is
/// retried row by row so one bad row does not hold back the others.
#[derive(Debug)]
pub struct BatchExecutor<'a, S, Src, T> {
    ctx: &'a JobContext<S, Src, T>,
    table: &'a str,
    shutdown_rx: &'a ShutdownRx,
}

impl<'a, S, Src, T> BatchExecutor<'a, S, Src, T>
where
    S: JobStore + LedgerStore + Sync,
    Src: Sync,
    T: Target + Sync,
{
    pub fn new(ctx: &'a JobContext<S, Src, T>, table: &'a str, shutdown_rx: &'a ShutdownRx) -> Self {
        Self {
            ctx,
            table,
            shutdown_rx,
        }
    }

    /// Executes the operations. Fails only when the target or the ledger became unreachable;
    /// lanes that are already running finish their current chunk first.
    pub async fn execute(&self, operations: Vec<ChangeOperation>) -> SyncResult<ExecutionOutcome> {
        if operations.is_empty() {
            return Ok(ExecutionOutcome::default());
        }

        let count = operations.len();
        let lanes = partition(operations, self.ctx.config.max_parallel_operations);
        debug!(table = self.table, operations = count, lanes = lanes.len(), "executing changes");

        let results = join_all(lanes.into_iter().map(|lane| self.run_lane(lane))).await;

        let mut outcome = ExecutionOutcome::default();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(lane_outcome) => outcome.merge(lane_outcome),
                Err(err) => errors.push(err),
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        info!(
            job_id = %self.ctx.job_id,
            table = self.table,
            applied = outcome.applied,
            conflicts = outcome.conflicts.len(),
            failures = outcome.failures.len(),
            "executed changes"
        );

        Ok(outcome)
    }

    async fn run_lane(&self, lane: Vec<ChangeOperation>) -> SyncResult<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome::default();

        for chunk in lane.chunks(self.ctx.config.batch_size.max(1)) {
            if self.shutdown_rx.is_shutdown() {
                outcome.stopped = true;
                break;
            }

            outcome.merge(self.apply_chunk(chunk).await?);
        }

        Ok(outcome)
    }

    async fn apply_chunk(&self, chunk: &[ChangeOperation]) -> SyncResult<ExecutionOutcome> {
        let writes: Vec<RowWrite> = chunk.iter().map(to_write).collect();

        match apply_writes(&self.ctx.target, self.table, &writes, &self.ctx.config.retry).await {
            Ok(()) => self.commit(chunk, writes).await,
            Err(err) if err.kind().is_connection_error() => Err(err),
            Err(err) if chunk.len() > 1 => {
                warn!(
                    table = self.table,
                    rows = chunk.len(),
                    error = %err.summary(),
                    "chunk failed, applying rows one by one"
                );

                let mut outcome = ExecutionOutcome::default();
                for operation in chunk {
                    outcome.merge(self.apply_one(operation).await?);
                }

                Ok(outcome)
            }
            Err(err) => self.row_failed(&chunk[0], err),
        }
    }

    async fn apply_one(&self, operation: &ChangeOperation) -> SyncResult<ExecutionOutcome> {
        let write = to_write(operation);

        match apply_writes(
            &self.ctx.target,
            self.table,
            std::slice::from_ref(&write),
            &self.ctx.config.retry,
        )
        .await
        {
            Ok(()) => {
                self.commit(std::slice::from_ref(operation), vec![write])
                    .await
            }
            Err(err) => self.row_failed(operation, err),
        }
    }

    fn row_failed(
        &self,
        operation: &ChangeOperation,
        error: SyncError,
    ) -> SyncResult<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome::default();

        match error.kind() {
            kind if kind.is_connection_error() => return Err(error),
            ErrorKind::ConstraintViolation => {
                outcome
                    .conflicts
                    .push(constraint_conflict(self.ctx.job_id, operation, &error));
            }
            _ => outcome.failures.push((operation.key.clone(), error)),
        }

        Ok(outcome)
    }

    /// Records every key of a committed chunk whose ledger entry could not be appended, so the
    /// rows can be found although rollback cannot revert them.
    async fn record_unledgered(&self, writes: &[RowWrite], cause: &SyncError) -> SyncResult<()> {
        let keys: Vec<String> = writes.iter().map(|write| write.key().to_string()).collect();
        error!(
            job_id = %self.ctx.job_id,
            table = self.table,
            keys = ?keys,
            error = %cause.summary(),
            "committed writes are missing from the ledger"
        );

        let error = sync_error!(
            cause.kind(),
            "Committed write is missing from the ledger",
            format!("the write was applied to the target but not recorded: {}", cause.summary())
        );
        for write in writes {
            self.ctx
                .record_error(Some(self.table), Some(write.key().clone()), &error)
                .await?;
        }

        Ok(())
    }

    /// Records committed writes in the ledger, then counts them.
    async fn commit(
        &self,
        chunk: &[ChangeOperation],
        writes: Vec<RowWrite>,
    ) -> SyncResult<ExecutionOutcome> {
        let entries = chunk
            .iter()
            .zip(&writes)
            .map(|(operation, write)| {
                let context = WriteContext {
                    previous: operation.target.as_ref().map(|state| state.image.clone()),
                    previous_baseline: operation.baseline.clone(),
                    baseline: operation
                        .source_fingerprint()
                        .map(|fingerprint| SyncBaseline::settled(fingerprint.clone())),
                };

                ledger_entry(
                    self.ctx.job_id,
                    self.table,
                    write,
                    context,
                    LedgerOrigin::Sync,
                    ENGINE_ACTOR,
                )
            })
            .collect();

        if let Err(err) = append_ledger(&self.ctx.store, entries, &self.ctx.config.retry).await {
            self.record_unledgered(&writes, &err).await?;
            return Err(err);
        }

        let applied = writes.len() as u64;
        self.ctx
            .store
            .add_table_progress(
                self.ctx.job_id,
                self.table,
                TableProgress::processed(applied, applied),
            )
            .await?;

        Ok(ExecutionOutcome {
            applied,
            ..ExecutionOutcome::default()
        })
    }
}
