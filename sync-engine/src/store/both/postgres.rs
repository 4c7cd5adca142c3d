use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::shared::{ConflictStrategy, IntoConnectOptions, PgConnectionConfig, SYNC_STATE_OPTIONS};
use postgres::state::{conflicts, events, jobs, ledger};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::{ErrorKind, SyncResult};
use crate::state::audit::{AuditEvent, SyncErrorRecord};
use crate::state::conflict::{Conflict, ConflictResolution};
use crate::state::job::{JobStatus, SyncJob};
use crate::state::ledger::{LedgerEntry, SyncBaseline};
use crate::state::table::{TableProgress, TableStatus, TableSyncTask};
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::{ConflictId, Fingerprint, JobId, PrimaryKey};
use crate::{bail, sync_error};

/// Maximum number of connections in the pool.
const MAX_POOL_CONNECTIONS: u32 = 8;

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a lazily connected pool for the state store.
pub fn create_state_pool(config: &PgConnectionConfig) -> PgPool {
    let options = config.with_db(Some(&SYNC_STATE_OPTIONS));

    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(options)
}

fn to_json<T: Serialize>(value: &T) -> SyncResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> SyncResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn opt_to_json<T: Serialize>(value: Option<&T>) -> SyncResult<Option<serde_json::Value>> {
    value.map(to_json).transpose()
}

fn opt_from_json<T: DeserializeOwned>(value: Option<serde_json::Value>) -> SyncResult<Option<T>> {
    value.map(from_json).transpose()
}

fn parse<T>(value: &str, what: &'static str) -> SyncResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|err: String| sync_error!(ErrorKind::ConversionError, what, err))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn job_to_row(job: &SyncJob) -> SyncResult<jobs::JobRow> {
    Ok(jobs::JobRow {
        id: job.id.into_inner(),
        kind: job.kind.as_str().to_string(),
        status: job.status.as_str().to_string(),
        config: to_json(&job.config)?,
        created_at: job.created_at,
        updated_at: job.updated_at,
        rolled_back_at: job.rolled_back_at,
    })
}

fn job_from_row(row: jobs::JobRow) -> SyncResult<SyncJob> {
    Ok(SyncJob {
        id: row.id.into(),
        kind: parse(&row.kind, "Invalid stored job kind")?,
        status: parse(&row.status, "Invalid stored job status")?,
        config: from_json(row.config)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
        rolled_back_at: row.rolled_back_at,
    })
}

fn task_from_row(row: jobs::TableTaskRow) -> SyncResult<TableSyncTask> {
    Ok(TableSyncTask {
        table: row.table_name,
        status: parse(&row.status, "Invalid stored table status")?,
        records_processed: to_u64(row.records_processed),
        records_total: to_u64(row.records_total),
        change_count: to_u64(row.change_count),
        conflict_count: to_u64(row.conflict_count),
        started_at: row.started_at,
        finished_at: row.finished_at,
    })
}

fn conflict_to_row(conflict: &Conflict) -> SyncResult<conflicts::ConflictRow> {
    let detail = if conflict.schema_mismatches.is_empty() {
        None
    } else {
        Some(to_json(&conflict.schema_mismatches)?)
    };

    Ok(conflicts::ConflictRow {
        id: conflict.id.into_inner(),
        job_id: conflict.job_id.into_inner(),
        table_name: conflict.table.clone(),
        primary_key: opt_to_json(conflict.key.as_ref())?,
        kind: conflict.kind.as_str().to_string(),
        status: conflict.status.as_str().to_string(),
        source_value: opt_to_json(conflict.source_value.as_ref())?,
        target_value: opt_to_json(conflict.target_value.as_ref())?,
        source_modified_at: conflict.source_modified_at,
        target_modified_at: conflict.target_modified_at,
        description: conflict.description.clone(),
        detail,
        detected_at: conflict.detected_at,
        resolution: conflict.resolution.map(|s| s.as_str().to_string()),
        resolved_value: opt_to_json(conflict.resolved_value.as_ref())?,
        resolved_by: conflict.resolved_by.clone(),
        resolved_at: conflict.resolved_at,
    })
}

fn conflict_from_row(row: conflicts::ConflictRow) -> SyncResult<Conflict> {
    let resolution = row
        .resolution
        .as_deref()
        .map(|value| parse::<ConflictStrategy>(value, "Invalid stored conflict resolution"))
        .transpose()?;

    Ok(Conflict {
        id: row.id.into(),
        job_id: row.job_id.into(),
        table: row.table_name,
        key: opt_from_json(row.primary_key)?,
        kind: parse(&row.kind, "Invalid stored conflict kind")?,
        status: parse(&row.status, "Invalid stored conflict status")?,
        source_value: opt_from_json(row.source_value)?,
        target_value: opt_from_json(row.target_value)?,
        source_modified_at: row.source_modified_at,
        target_modified_at: row.target_modified_at,
        description: row.description,
        schema_mismatches: opt_from_json(row.detail)?.unwrap_or_default(),
        detected_at: row.detected_at,
        resolution,
        resolved_value: opt_from_json(row.resolved_value)?,
        resolved_by: row.resolved_by,
        resolved_at: row.resolved_at,
    })
}

fn ledger_to_append(entry: &LedgerEntry) -> SyncResult<ledger::LedgerAppend> {
    let key_text = entry.key.key_text();
    let baseline = entry
        .baseline
        .as_ref()
        .map(|baseline| baseline_to_row(key_text.clone(), baseline));

    Ok(ledger::LedgerAppend {
        row: ledger::LedgerRow {
            sequence: 0,
            job_id: entry.job_id.into_inner(),
            table_name: entry.table.clone(),
            primary_key: to_json(&entry.key)?,
            key_text,
            operation: entry.operation.as_str().to_string(),
            previous_value: opt_to_json(entry.previous.as_ref())?,
            new_value: opt_to_json(entry.new.as_ref())?,
            previous_baseline: opt_to_json(entry.previous_baseline.as_ref())?,
            baseline: opt_to_json(entry.baseline.as_ref())?,
            origin: entry.origin.as_str().to_string(),
            actor: entry.actor.clone(),
            applied_at: entry.applied_at,
        },
        baseline,
    })
}

fn ledger_from_row(row: ledger::LedgerRow) -> SyncResult<LedgerEntry> {
    Ok(LedgerEntry {
        sequence: to_u64(row.sequence),
        job_id: row.job_id.into(),
        table: row.table_name,
        key: from_json(row.primary_key)?,
        operation: parse(&row.operation, "Invalid stored ledger operation")?,
        previous: opt_from_json(row.previous_value)?,
        new: opt_from_json(row.new_value)?,
        previous_baseline: opt_from_json(row.previous_baseline)?,
        baseline: opt_from_json(row.baseline)?,
        origin: parse(&row.origin, "Invalid stored ledger origin")?,
        actor: row.actor,
        applied_at: row.applied_at,
    })
}

fn baseline_to_row(key_text: String, baseline: &SyncBaseline) -> ledger::BaselineRow {
    ledger::BaselineRow {
        key_text,
        source_fingerprint: baseline.source.as_ref().map(|f| f.as_str().to_string()),
        target_fingerprint: baseline.target.as_ref().map(|f| f.as_str().to_string()),
    }
}

/// Postgres backed implementation of [`JobStore`] and [`LedgerStore`].
///
/// State lives in the `sync` schema created by
/// [`migrate_state_store`](crate::migrations::migrate_state_store). Every call maps to a single
/// statement or transaction, so the store holds no cache and can be shared by processes.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &PgConnectionConfig) -> Self {
        Self::new(create_state_pool(config))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl JobStore for PostgresStore {
    async fn insert_job(&self, job: SyncJob, tasks: Vec<TableSyncTask>) -> SyncResult<()> {
        let job_row = job_to_row(&job)?;
        let task_rows: Vec<jobs::TableTaskRow> = tasks
            .iter()
            .enumerate()
            .map(|(position, task)| jobs::TableTaskRow {
                job_id: job_row.id,
                table_name: task.table.clone(),
                position: i32::try_from(position).unwrap_or(i32::MAX),
                status: task.status.as_str().to_string(),
                records_processed: to_i64(task.records_processed),
                records_total: to_i64(task.records_total),
                change_count: to_i64(task.change_count),
                conflict_count: to_i64(task.conflict_count),
                started_at: task.started_at,
                finished_at: task.finished_at,
            })
            .collect();

        jobs::insert_job(&self.pool, &job_row, &task_rows).await?;
        debug!(job_id = %job.id, tables = task_rows.len(), "stored new job");

        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> SyncResult<Option<SyncJob>> {
        jobs::get_job(&self.pool, job_id.into_inner())
            .await?
            .map(job_from_row)
            .transpose()
    }

    async fn list_jobs(&self) -> SyncResult<Vec<SyncJob>> {
        jobs::list_jobs(&self.pool)
            .await?
            .into_iter()
            .map(job_from_row)
            .collect()
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> SyncResult<()> {
        let updated =
            jobs::update_job_status(&self.pool, job_id.into_inner(), status.as_str(), Utc::now())
                .await?;
        if !updated {
            bail!(ErrorKind::JobNotFound, "Job not found", format!("No job with id {job_id}"));
        }

        Ok(())
    }

    async fn mark_rolled_back(
        &self,
        job_id: JobId,
        rolled_back_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let updated =
            jobs::set_job_rolled_back(&self.pool, job_id.into_inner(), rolled_back_at).await?;
        if !updated {
            bail!(ErrorKind::JobNotFound, "Job not found", format!("No job with id {job_id}"));
        }

        Ok(())
    }

    async fn get_table_tasks(&self, job_id: JobId) -> SyncResult<Vec<TableSyncTask>> {
        jobs::get_table_tasks(&self.pool, job_id.into_inner())
            .await?
            .into_iter()
            .map(task_from_row)
            .collect()
    }

    async fn update_table_status(
        &self,
        job_id: JobId,
        table: &str,
        status: TableStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        let updated = jobs::update_table_task_status(
            &self.pool,
            job_id.into_inner(),
            table,
            status.as_str(),
            started_at,
            finished_at,
        )
        .await?;
        if !updated {
            bail!(
                ErrorKind::TableNotInJob,
                "Table not found in job",
                format!("Table '{table}' is not part of job {job_id}")
            );
        }

        Ok(())
    }

    async fn add_table_progress(
        &self,
        job_id: JobId,
        table: &str,
        progress: TableProgress,
    ) -> SyncResult<()> {
        let updated = jobs::increment_table_progress(
            &self.pool,
            job_id.into_inner(),
            table,
            to_i64(progress.records_total),
            to_i64(progress.records_processed),
            to_i64(progress.change_count),
        )
        .await?;
        if !updated {
            bail!(
                ErrorKind::TableNotInJob,
                "Table not found in job",
                format!("Table '{table}' is not part of job {job_id}")
            );
        }

        Ok(())
    }

    async fn refresh_conflict_count(&self, job_id: JobId, table: &str) -> SyncResult<u64> {
        let count = conflicts::refresh_conflict_count(&self.pool, job_id.into_inner(), table).await?;

        Ok(to_u64(count))
    }

    async fn insert_conflict(&self, conflict: Conflict) -> SyncResult<bool> {
        let row = conflict_to_row(&conflict)?;

        Ok(conflicts::insert_conflict_if_absent(&self.pool, &row).await?)
    }

    async fn get_conflict(
        &self,
        job_id: JobId,
        conflict_id: ConflictId,
    ) -> SyncResult<Option<Conflict>> {
        conflicts::get_conflict(&self.pool, job_id.into_inner(), conflict_id.into_inner())
            .await?
            .map(conflict_from_row)
            .transpose()
    }

    async fn list_conflicts(&self, job_id: JobId) -> SyncResult<Vec<Conflict>> {
        conflicts::list_conflicts(&self.pool, job_id.into_inner())
            .await?
            .into_iter()
            .map(conflict_from_row)
            .collect()
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> SyncResult<bool> {
        let resolved_value = opt_to_json(resolution.resolved_value.as_ref())?;

        Ok(conflicts::resolve_conflict(
            &self.pool,
            conflict_id.into_inner(),
            resolution.strategy.as_str(),
            resolved_value.as_ref(),
            &resolution.resolved_by,
            resolution.resolved_at,
        )
        .await?)
    }

    async fn pending_conflict_keys(
        &self,
        job_id: JobId,
        table: &str,
    ) -> SyncResult<HashSet<PrimaryKey>> {
        conflicts::get_pending_conflict_keys(&self.pool, job_id.into_inner(), table)
            .await?
            .into_iter()
            .map(from_json)
            .collect()
    }

    async fn insert_error(&self, record: SyncErrorRecord) -> SyncResult<()> {
        let row = events::ErrorRow {
            job_id: record.job_id.into_inner(),
            table_name: record.table,
            primary_key: opt_to_json(record.key.as_ref())?,
            kind: record.kind,
            message: record.message,
            occurred_at: record.occurred_at,
        };

        Ok(events::insert_error(&self.pool, &row).await?)
    }

    async fn list_errors(&self, job_id: JobId) -> SyncResult<Vec<SyncErrorRecord>> {
        events::list_errors(&self.pool, job_id.into_inner())
            .await?
            .into_iter()
            .map(|row| {
                Ok(SyncErrorRecord {
                    job_id: row.job_id.into(),
                    table: row.table_name,
                    key: opt_from_json(row.primary_key)?,
                    kind: row.kind,
                    message: row.message,
                    occurred_at: row.occurred_at,
                })
            })
            .collect()
    }

    async fn insert_audit_event(&self, event: AuditEvent) -> SyncResult<()> {
        let row = events::AuditEventRow {
            job_id: event.job_id.into_inner(),
            table_name: event.table,
            event_type: event.event_type.as_str().to_string(),
            message: event.message,
            detail: event.detail,
            created_at: event.created_at,
        };

        Ok(events::insert_audit_event(&self.pool, &row).await?)
    }

    async fn list_audit_events(&self, job_id: JobId) -> SyncResult<Vec<AuditEvent>> {
        events::list_audit_events(&self.pool, job_id.into_inner())
            .await?
            .into_iter()
            .map(|row| {
                Ok(AuditEvent {
                    job_id: row.job_id.into(),
                    table: row.table_name,
                    event_type: parse(&row.event_type, "Invalid stored audit event type")?,
                    message: row.message,
                    detail: row.detail,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn get_checkpoint(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(jobs::get_checkpoint(&self.pool, table).await?)
    }

    async fn set_checkpoint(&self, table: &str, checkpoint: DateTime<Utc>) -> SyncResult<()> {
        Ok(jobs::set_checkpoint(&self.pool, table, checkpoint).await?)
    }
}

impl LedgerStore for PostgresStore {
    async fn append_entries(&self, entries: Vec<LedgerEntry>) -> SyncResult<Vec<LedgerEntry>> {
        let appends = entries
            .iter()
            .map(ledger_to_append)
            .collect::<SyncResult<Vec<_>>>()?;

        let sequences = ledger::append_ledger_rows(&self.pool, &appends).await?;

        Ok(entries
            .into_iter()
            .zip(sequences)
            .map(|(mut entry, sequence)| {
                entry.sequence = to_u64(sequence);
                entry
            })
            .collect())
    }

    async fn entries_for_job(&self, job_id: JobId) -> SyncResult<Vec<LedgerEntry>> {
        ledger::get_ledger_rows(&self.pool, job_id.into_inner())
            .await?
            .into_iter()
            .map(ledger_from_row)
            .collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> SyncResult<BTreeMap<JobId, u64>> {
        let purged = ledger::purge_ledger_rows(&self.pool, cutoff).await?;

        Ok(purged
            .into_iter()
            .map(|(job_id, count)| (JobId::from(job_id), count))
            .collect())
    }

    async fn purged_before(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(ledger::get_purge_watermark(&self.pool).await?)
    }

    async fn get_baselines(
        &self,
        table: &str,
        keys: &[PrimaryKey],
    ) -> SyncResult<HashMap<PrimaryKey, SyncBaseline>> {
        let by_text: HashMap<String, &PrimaryKey> =
            keys.iter().map(|key| (key.key_text(), key)).collect();
        let key_texts: Vec<String> = by_text.keys().cloned().collect();

        let rows = ledger::get_baselines(&self.pool, table, &key_texts).await?;

        let mut baselines = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Some(key) = by_text.get(&row.key_text) {
                let baseline = SyncBaseline::new(
                    row.source_fingerprint.map(Fingerprint::from_hex),
                    row.target_fingerprint.map(Fingerprint::from_hex),
                );
                baselines.insert((*key).clone(), baseline);
            }
        }

        Ok(baselines)
    }

    async fn put_baselines(
        &self,
        table: &str,
        baselines: Vec<(PrimaryKey, SyncBaseline)>,
    ) -> SyncResult<()> {
        let rows: Vec<ledger::BaselineRow> = baselines
            .iter()
            .map(|(key, baseline)| baseline_to_row(key.key_text(), baseline))
            .collect();

        Ok(ledger::upsert_baselines(&self.pool, table, &rows).await?)
    }
}
