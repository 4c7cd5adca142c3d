//! Rollback and retention of the change ledger.
//!
//! Entries are only ever appended. A rollback appends the reversal of every write a job made
//! after a cutoff, a purge drops entries older than the retention window.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use config::shared::RollbackConfig;
use serde_json::json;
use tracing::{error, info, warn};

use crate::bail;
use crate::connector::{RowWrite, Target};
use crate::context::JobContext;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::executor::write::{append_ledger, apply_writes};
use crate::state::audit::{AuditEvent, AuditEventType};
use crate::state::job::JobStatus;
use crate::state::ledger::{LedgerEntry, LedgerOrigin};
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::{JobId, TableRow};

/// Outcome of a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Number of reverted writes per table.
    pub reverted: BTreeMap<String, u64>,
}

impl RollbackSummary {
    pub fn total(&self) -> u64 {
        self.reverted.values().sum()
    }
}

/// Returns the oldest point in time that is still inside the retention window.
pub fn retention_horizon(config: &RollbackConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(i64::from(config.retention_days))
}

fn reversal_write(entry: &LedgerEntry) -> RowWrite {
    match &entry.new {
        Some(image) => RowWrite::Upsert(TableRow::new(entry.key.clone(), image.clone())),
        None => RowWrite::Delete(entry.key.clone()),
    }
}

/// Checks that the job can be rolled back to `cutoff` and returns the entries to revert, grouped
/// by table in append order.
async fn plan_rollback<S, Src, T>(
    ctx: &JobContext<S, Src, T>,
    cutoff: DateTime<Utc>,
) -> SyncResult<BTreeMap<String, Vec<LedgerEntry>>>
where
    S: JobStore + LedgerStore,
{
    if !ctx.config.rollback.enabled {
        bail!(
            ErrorKind::RollbackDisabled,
            "Rollback is disabled",
            format!("job {} was created with rollback disabled", ctx.job_id)
        );
    }

    let Some(job) = ctx.store.get_job(ctx.job_id).await? else {
        bail!(
            ErrorKind::JobNotFound,
            "Job not found",
            format!("job {} does not exist", ctx.job_id)
        );
    };

    if matches!(job.status, JobStatus::Running | JobStatus::Deleted) {
        bail!(
            ErrorKind::InvalidState,
            "Job cannot be rolled back in its current state",
            format!("job {} is {}", job.id, job.status)
        );
    }

    if let Some(rolled_back_at) = job.rolled_back_at {
        bail!(
            ErrorKind::InvalidState,
            "Job was already rolled back",
            format!("job {} was rolled back at {rolled_back_at}", job.id)
        );
    }

    let horizon = retention_horizon(&ctx.config.rollback, Utc::now());
    if cutoff < horizon {
        bail!(
            ErrorKind::RetentionExpired,
            "Rollback cutoff lies outside the retention window",
            format!("cutoff {cutoff} is older than {horizon}")
        );
    }

    if let Some(purged_before) = ctx.store.purged_before().await? {
        if purged_before > cutoff {
            bail!(
                ErrorKind::RetentionExpired,
                "Ledger entries after the cutoff were purged",
                format!("entries before {purged_before} are gone, cutoff is {cutoff}")
            );
        }
    }

    let mut plan: BTreeMap<String, Vec<LedgerEntry>> = BTreeMap::new();
    for entry in ctx.store.entries_for_job(ctx.job_id).await? {
        if entry.origin == LedgerOrigin::Rollback || entry.applied_at < cutoff {
            continue;
        }

        if entry.applied_at < horizon {
            bail!(
                ErrorKind::RetentionExpired,
                "A ledger entry to revert lies outside the retention window",
                format!("entry {} was applied at {}", entry.sequence, entry.applied_at)
            );
        }

        plan.entry(entry.table.clone()).or_default().push(entry);
    }

    Ok(plan)
}

/// Reapplies the writes a table's reversals undid, oldest write first.
fn restoring_writes(reversals: &[LedgerEntry], actor: &str) -> Vec<RowWrite> {
    let applied_at = Utc::now();
    reversals
        .iter()
        .rev()
        .map(|reversal| reversal_write(&reversal.reversal(actor, applied_at)))
        .collect()
}

/// Reverts every write `ctx`'s job made at or after `cutoff`.
///
/// All checks run before the first write. Each table is reverted in one atomic target batch,
/// newest write first. When a table cannot be reverted, the tables reverted before it are
/// restored and nothing is appended to the ledger. Once every table is reverted, the
/// reversals are appended in one call so they restore the baselines of the affected rows.
pub async fn rollback<S, Src, T>(
    ctx: &JobContext<S, Src, T>,
    cutoff: DateTime<Utc>,
    actor: &str,
) -> SyncResult<RollbackSummary>
where
    S: JobStore + LedgerStore,
    T: Target,
{
    let plan = plan_rollback(ctx, cutoff).await?;
    let mut summary = RollbackSummary::default();
    let mut reverted: Vec<(String, Vec<LedgerEntry>)> = Vec::with_capacity(plan.len());

    for (table, entries) in plan {
        let applied_at = Utc::now();
        let reversals: Vec<LedgerEntry> = entries
            .iter()
            .rev()
            .map(|entry| entry.reversal(actor, applied_at))
            .collect();
        let writes: Vec<RowWrite> = reversals.iter().map(reversal_write).collect();

        if let Err(err) = apply_writes(&ctx.target, &table, &writes, &ctx.config.retry).await {
            error!(job_id = %ctx.job_id, %table, error = %err, "table could not be reverted");
            return Err(restore_reverted(ctx, reverted, actor, err).await);
        }

        info!(job_id = %ctx.job_id, %table, reverted = writes.len(), "reverted table");
        summary.reverted.insert(table.clone(), writes.len() as u64);
        reverted.push((table, reversals));
    }

    let reversals: Vec<LedgerEntry> = reverted
        .iter()
        .flat_map(|(_, reversals)| reversals.iter().cloned())
        .collect();
    if let Err(err) = append_ledger(&ctx.store, reversals, &ctx.config.retry).await {
        error!(job_id = %ctx.job_id, error = %err, "rollback could not be recorded");
        return Err(restore_reverted(ctx, reverted, actor, err).await);
    }

    ctx.store.mark_rolled_back(ctx.job_id, Utc::now()).await?;
    ctx.audit(
        AuditEvent::new(
            ctx.job_id,
            AuditEventType::RollbackCompleted,
            format!(
                "{actor} rolled back {} writes applied since {cutoff}",
                summary.total()
            ),
        )
        .with_detail(json!({
            "cutoff": cutoff.to_rfc3339(),
            "reverted": summary.reverted,
        })),
    )
    .await?;

    Ok(summary)
}

/// Puts the already reverted tables back into their state before the rollback and returns the
/// error that aborted it, together with any error hit while restoring.
async fn restore_reverted<S, Src, T>(
    ctx: &JobContext<S, Src, T>,
    reverted: Vec<(String, Vec<LedgerEntry>)>,
    actor: &str,
    cause: SyncError,
) -> SyncError
where
    T: Target,
{
    let mut errors = vec![cause];

    for (table, reversals) in reverted.into_iter().rev() {
        let writes = restoring_writes(&reversals, actor);
        match apply_writes(&ctx.target, &table, &writes, &ctx.config.retry).await {
            Ok(()) => {
                warn!(
                    job_id = %ctx.job_id,
                    %table,
                    restored = writes.len(),
                    "restored table after failed rollback"
                );
            }
            Err(err) => {
                error!(
                    job_id = %ctx.job_id,
                    %table,
                    error = %err,
                    "table could not be restored after failed rollback"
                );
                errors.push(err);
            }
        }
    }

    SyncError::from(errors)
}

/// Deletes ledger entries older than the retention window and records the purge on every job
/// that lost entries.
pub async fn purge_ledger<S>(
    store: &S,
    config: &RollbackConfig,
) -> SyncResult<BTreeMap<JobId, u64>>
where
    S: JobStore + LedgerStore,
{
    let cutoff = retention_horizon(config, Utc::now());
    let purged = store.purge_before(cutoff).await?;

    for (job_id, count) in &purged {
        store
            .insert_audit_event(
                AuditEvent::new(
                    *job_id,
                    AuditEventType::LedgerPurged,
                    format!("purged {count} ledger entries applied before {cutoff}"),
                )
                .with_detail(json!({ "cutoff": cutoff.to_rfc3339(), "count": count })),
            )
            .await?;
    }

    info!(
        %cutoff,
        jobs = purged.len(),
        entries = purged.values().sum::<u64>(),
        "purged ledger"
    );

    Ok(purged)
}
