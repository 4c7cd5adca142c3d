use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use config::shared::ConflictStrategy;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bail;
use crate::connector::{RowWrite, Target};
use crate::context::{ENGINE_ACTOR, JobContext};
use crate::error::{ErrorKind, SyncResult};
use crate::executor::write::{WriteContext, apply_single_write};
use crate::state::audit::{AuditEvent, AuditEventType};
use crate::state::conflict::{
    Conflict, ConflictKind, ConflictResolution, ConflictStatus, ResolutionRequest,
    ResolveAllSummary,
};
use crate::state::ledger::{LedgerOrigin, SyncBaseline};
use crate::state::table::TableProgress;
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::{ConflictId, Fingerprint, PrimaryKey, RowImage, TableRow};

/// Per conflict locks shared by single and bulk resolutions.
///
/// Entries are dropped once no request holds or waits for them.
#[derive(Debug, Clone, Default)]
pub struct ConflictLocks {
    locks: Arc<Mutex<HashMap<ConflictId, Arc<Mutex<()>>>>>,
}

impl ConflictLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, conflict_id: ConflictId) -> ConflictGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(conflict_id).or_default().clone()
        };

        let guard = lock.lock_owned().await;

        ConflictGuard {
            conflict_id,
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    async fn release(&self, conflict_id: ConflictId) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(&conflict_id) {
            // Only the map itself still references the lock.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&conflict_id);
            }
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Held while a conflict is being resolved.
#[derive(Debug)]
pub struct ConflictGuard {
    conflict_id: ConflictId,
    locks: ConflictLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConflictGuard {
    pub async fn release(mut self) {
        self.guard.take();
        self.locks.release(self.conflict_id).await;
    }
}

/// What a strategy decided for a data or constraint conflict.
enum Outcome {
    /// Write the given row image, or delete the row when `None`.
    Write(Option<RowImage>),
    /// Keep the target and record the divergence as agreed.
    Accept,
}

/// Picks the side `newest_wins` keeps. A side without a timestamp loses, ties go to the
/// target.
fn newest_side(conflict: &Conflict) -> SyncResult<Outcome> {
    match (conflict.source_modified_at, conflict.target_modified_at) {
        (None, None) => bail!(
            ErrorKind::AmbiguousResolution,
            "Neither side carries a modification timestamp",
            format!("conflict {} has no timestamps to compare", conflict.id)
        ),
        (Some(_), None) => Ok(Outcome::Write(conflict.source_value.clone())),
        (None, Some(_)) => Ok(Outcome::Accept),
        (Some(source), Some(target)) if source > target => {
            Ok(Outcome::Write(conflict.source_value.clone()))
        }
        (Some(_), Some(_)) => Ok(Outcome::Accept),
    }
}

fn decide(conflict: &Conflict, request: &ResolutionRequest) -> SyncResult<Outcome> {
    match request.strategy {
        ConflictStrategy::SourceWins => Ok(Outcome::Write(conflict.source_value.clone())),
        ConflictStrategy::TargetWins => Ok(Outcome::Accept),
        ConflictStrategy::NewestWins => newest_side(conflict),
        ConflictStrategy::Manual => match &request.manual_value {
            Some(value) => Ok(Outcome::Write(Some(value.clone()))),
            None => bail!(
                ErrorKind::MissingManualValue,
                "Manual resolution requires a replacement value",
                format!("conflict {} was resolved manually without a value", conflict.id)
            ),
        },
    }
}

/// Settles conflicts of one job.
///
/// Every write goes through the single operation path of the executor so it is recorded in the
/// ledger like any synced change.
#[derive(Debug)]
pub struct ConflictResolver<'a, S, Src, T> {
    ctx: &'a JobContext<S, Src, T>,
    locks: &'a ConflictLocks,
}

impl<'a, S, Src, T> ConflictResolver<'a, S, Src, T>
where
    S: JobStore + LedgerStore + Sync,
    Src: Sync,
    T: Target + Sync,
{
    pub fn new(ctx: &'a JobContext<S, Src, T>, locks: &'a ConflictLocks) -> Self {
        Self { ctx, locks }
    }

    fn fingerprint(&self, image: &RowImage) -> Fingerprint {
        Fingerprint::of(image, self.ctx.config.modified_column.as_deref())
    }

    /// Resolves a single conflict and returns it in its resolved state.
    pub async fn resolve(
        &self,
        conflict_id: ConflictId,
        request: &ResolutionRequest,
    ) -> SyncResult<Conflict> {
        let guard = self.locks.lock(conflict_id).await;
        let result = self.resolve_locked(conflict_id, request).await;
        guard.release().await;

        result
    }

    async fn resolve_locked(
        &self,
        conflict_id: ConflictId,
        request: &ResolutionRequest,
    ) -> SyncResult<Conflict> {
        let Some(mut conflict) = self.ctx.store.get_conflict(self.ctx.job_id, conflict_id).await?
        else {
            bail!(
                ErrorKind::ConflictNotFound,
                "Conflict not found",
                format!("conflict {conflict_id} does not exist in job {}", self.ctx.job_id)
            );
        };

        if !conflict.is_pending() {
            bail!(
                ErrorKind::AlreadyResolved,
                "Conflict is already resolved",
                format!("conflict {conflict_id} was resolved before")
            );
        }

        let resolved_value = match conflict.kind {
            ConflictKind::Schema => {
                if request.strategy == ConflictStrategy::NewestWins {
                    bail!(
                        ErrorKind::AmbiguousResolution,
                        "Schema conflicts have no newer side",
                        format!("conflict {conflict_id} is a schema conflict")
                    );
                }

                None
            }
            ConflictKind::Data | ConflictKind::Constraint => {
                let outcome = decide(&conflict, request)?;
                self.settle_row(&conflict, outcome, &request.actor).await?
            }
        };

        let resolution = ConflictResolution {
            strategy: request.strategy,
            resolved_value: resolved_value.clone(),
            resolved_by: request.actor.clone(),
            resolved_at: Utc::now(),
        };

        if !self
            .ctx
            .store
            .resolve_conflict(conflict_id, resolution.clone())
            .await?
        {
            bail!(
                ErrorKind::AlreadyResolved,
                "Conflict is already resolved",
                format!("conflict {conflict_id} was resolved concurrently")
            );
        }

        if conflict.kind != ConflictKind::Schema {
            self.ctx
                .store
                .add_table_progress(
                    self.ctx.job_id,
                    &conflict.table,
                    TableProgress::processed(1, 0),
                )
                .await?;
        }
        self.ctx
            .store
            .refresh_conflict_count(self.ctx.job_id, &conflict.table)
            .await?;

        self.ctx
            .audit(
                AuditEvent::for_table(
                    self.ctx.job_id,
                    &conflict.table,
                    AuditEventType::ConflictResolved,
                    format!(
                        "conflict {conflict_id} resolved with {} by {}",
                        request.strategy, request.actor
                    ),
                )
                .with_detail(json!({
                    "conflict_id": conflict_id.to_string(),
                    "kind": conflict.kind.as_str(),
                    "strategy": request.strategy.as_str(),
                })),
            )
            .await?;

        info!(
            job_id = %self.ctx.job_id,
            table = %conflict.table,
            %conflict_id,
            strategy = %request.strategy,
            "resolved conflict"
        );

        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution.strategy);
        conflict.resolved_value = resolution.resolved_value;
        conflict.resolved_by = Some(resolution.resolved_by);
        conflict.resolved_at = Some(resolution.resolved_at);

        Ok(conflict)
    }

    /// Applies the outcome of a row conflict. Returns the value the row was resolved to.
    async fn settle_row(
        &self,
        conflict: &Conflict,
        outcome: Outcome,
        actor: &str,
    ) -> SyncResult<Option<RowImage>> {
        let Some(key) = conflict.key.clone() else {
            bail!(
                ErrorKind::InvalidData,
                "Row conflict without a primary key",
                format!("conflict {} has no key", conflict.id)
            );
        };

        let source = conflict.source_value.as_ref().map(|image| self.fingerprint(image));
        let target = conflict.target_value.as_ref().map(|image| self.fingerprint(image));

        match outcome {
            Outcome::Accept => {
                self.ctx
                    .store
                    .put_baselines(&conflict.table, vec![(key, SyncBaseline::new(source, target))])
                    .await?;

                Ok(conflict.target_value.clone())
            }
            Outcome::Write(value) => {
                let baseline = value.as_ref().map(|image| {
                    SyncBaseline::new(source.clone(), Some(self.fingerprint(image)))
                });
                let write = match &value {
                    Some(image) => RowWrite::Upsert(TableRow::new(key.clone(), image.clone())),
                    None => RowWrite::Delete(key.clone()),
                };

                self.write(conflict, key, write, baseline, actor).await?;
                self.ctx
                    .store
                    .add_table_progress(
                        self.ctx.job_id,
                        &conflict.table,
                        TableProgress::processed(0, 1),
                    )
                    .await?;

                Ok(value)
            }
        }
    }

    async fn write(
        &self,
        conflict: &Conflict,
        key: PrimaryKey,
        write: RowWrite,
        baseline: Option<SyncBaseline>,
        actor: &str,
    ) -> SyncResult<()> {
        let previous_baseline = self
            .ctx
            .store
            .get_baselines(&conflict.table, std::slice::from_ref(&key))
            .await?
            .remove(&key);

        let context = WriteContext {
            previous: conflict.target_value.clone(),
            previous_baseline,
            baseline,
        };

        let entry = apply_single_write(
            &self.ctx.target,
            &self.ctx.store,
            &self.ctx.config.retry,
            self.ctx.job_id,
            &conflict.table,
            write,
            context,
            LedgerOrigin::Resolution,
            actor,
        )
        .await?;

        debug!(
            table = %conflict.table,
            sequence = entry.sequence,
            operation = %entry.operation.as_str(),
            "applied resolution write"
        );

        Ok(())
    }

    /// Resolves every pending conflict of the job with one strategy.
    ///
    /// Conflicts that got resolved in the meantime are skipped, other failures are collected
    /// in the summary and leave the conflict pending.
    pub async fn resolve_all(
        &self,
        strategy: ConflictStrategy,
        actor: &str,
    ) -> SyncResult<ResolveAllSummary> {
        if strategy == ConflictStrategy::Manual {
            bail!(
                ErrorKind::MissingManualValue,
                "Manual resolution requires a value per conflict",
                "bulk resolution cannot use the manual strategy"
            );
        }

        let pending: Vec<ConflictId> = self
            .ctx
            .store
            .list_conflicts(self.ctx.job_id)
            .await?
            .into_iter()
            .filter(Conflict::is_pending)
            .map(|conflict| conflict.id)
            .collect();

        let request = ResolutionRequest::new(strategy, actor);
        let mut summary = ResolveAllSummary::default();

        for conflict_id in pending {
            match self.resolve(conflict_id, &request).await {
                Ok(_) => summary.resolved += 1,
                Err(err) if err.kind() == ErrorKind::AlreadyResolved => summary.skipped += 1,
                Err(err) if err.kind().is_connection_error() => return Err(err),
                Err(err) => {
                    warn!(%conflict_id, error = %err.summary(), "bulk resolution failed");
                    summary.failed += 1;
                    summary.errors.push((conflict_id, err));
                }
            }
        }

        info!(
            job_id = %self.ctx.job_id,
            %strategy,
            resolved = summary.resolved,
            skipped = summary.skipped,
            failed = summary.failed,
            "bulk resolution finished"
        );

        Ok(summary)
    }

    /// Resolves newly detected row conflicts with the job's default strategy.
    ///
    /// Returns how many were resolved. Conflicts that cannot be resolved stay pending.
    pub async fn auto_resolve(&self, conflicts: &[Conflict]) -> SyncResult<usize> {
        let strategy = self.ctx.config.default_conflict_strategy;
        if strategy == ConflictStrategy::Manual {
            return Ok(0);
        }

        let request = ResolutionRequest::new(strategy, ENGINE_ACTOR);
        let mut resolved = 0;

        for conflict in conflicts.iter().filter(|c| c.kind != ConflictKind::Schema) {
            match self.resolve(conflict.id, &request).await {
                Ok(_) => resolved += 1,
                Err(err) if err.kind().is_connection_error() => return Err(err),
                Err(err) => {
                    warn!(
                        conflict_id = %conflict.id,
                        table = %conflict.table,
                        %strategy,
                        error = %err.summary(),
                        "automatic resolution failed, conflict stays pending"
                    );
                }
            }
        }

        Ok(resolved)
    }
}
