use chrono::Utc;
use config::shared::RetryConfig;

use crate::connector::{RowWrite, Target};
use crate::error::SyncResult;
use crate::executor::retry::Backoff;
use crate::failpoints::{APPLY_BATCH, LEDGER_APPEND, sync_fail_point};
use crate::state::ledger::{ChangeKind, LedgerEntry, LedgerOrigin, SyncBaseline};
use crate::store::ledger::LedgerStore;
use crate::types::{JobId, RowImage};

/// Applies writes to the target as one atomic batch, retrying transient failures.
pub async fn apply_writes<T>(
    target: &T,
    table: &str,
    writes: &[RowWrite],
    retry: &RetryConfig,
) -> SyncResult<()>
where
    T: Target,
{
    let mut backoff = Backoff::new(retry);

    loop {
        let result = match sync_fail_point(APPLY_BATCH) {
            Ok(()) => target.apply_batch(table, writes).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(err) => backoff.retry_or_fail(err).await?,
        }
    }
}

/// Appends ledger entries, retrying transient failures.
pub async fn append_ledger<L>(
    ledger: &L,
    entries: Vec<LedgerEntry>,
    retry: &RetryConfig,
) -> SyncResult<Vec<LedgerEntry>>
where
    L: LedgerStore,
{
    let mut backoff = Backoff::new(retry);

    loop {
        let result = match sync_fail_point(LEDGER_APPEND) {
            Ok(()) => ledger.append_entries(entries.clone()).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(appended) => return Ok(appended),
            Err(err) => backoff.retry_or_fail(err).await?,
        }
    }
}

/// Describes the row a write replaces, used to build its ledger entry.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    /// Target image before the write.
    pub previous: Option<RowImage>,
    pub previous_baseline: Option<SyncBaseline>,
    /// Baseline of the key once the write is committed.
    pub baseline: Option<SyncBaseline>,
}

/// Builds the ledger entry recording `write`.
pub fn ledger_entry(
    job_id: JobId,
    table: &str,
    write: &RowWrite,
    context: WriteContext,
    origin: LedgerOrigin,
    actor: &str,
) -> LedgerEntry {
    let (operation, new) = match write {
        RowWrite::Upsert(row) if context.previous.is_some() => {
            (ChangeKind::Update, Some(row.values.clone()))
        }
        RowWrite::Upsert(row) => (ChangeKind::Insert, Some(row.values.clone())),
        RowWrite::Delete(_) => (ChangeKind::Delete, None),
    };

    LedgerEntry {
        sequence: 0,
        job_id,
        table: table.to_string(),
        key: write.key().clone(),
        operation,
        previous: context.previous,
        new,
        previous_baseline: context.previous_baseline,
        baseline: context.baseline,
        origin,
        actor: actor.to_string(),
        applied_at: Utc::now(),
    }
}

/// Applies a single write and appends its ledger entry.
///
/// This is the path every write outside of a sync batch takes, e.g. conflict resolutions.
#[allow(clippy::too_many_arguments)]
pub async fn apply_single_write<T, L>(
    target: &T,
    ledger: &L,
    retry: &RetryConfig,
    job_id: JobId,
    table: &str,
    write: RowWrite,
    context: WriteContext,
    origin: LedgerOrigin,
    actor: &str,
) -> SyncResult<LedgerEntry>
where
    T: Target,
    L: LedgerStore,
{
    apply_writes(target, table, std::slice::from_ref(&write), retry).await?;

    let entry = ledger_entry(job_id, table, &write, context, origin, actor);
    let mut appended = append_ledger(ledger, vec![entry.clone()], retry).await?;

    Ok(appended.pop().unwrap_or(entry))
}
