use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction, prelude::FromRow};
use uuid::Uuid;

/// A row of `sync.ledger`.
#[derive(Debug, Clone, FromRow)]
pub struct LedgerRow {
    /// Assigned by the database, ignored on insert.
    pub sequence: i64,
    pub job_id: Uuid,
    pub table_name: String,
    pub primary_key: serde_json::Value,
    pub key_text: String,
    pub operation: String,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub previous_baseline: Option<serde_json::Value>,
    pub baseline: Option<serde_json::Value>,
    pub origin: String,
    pub actor: String,
    pub applied_at: DateTime<Utc>,
}

/// A row of `sync.baselines`.
#[derive(Debug, Clone, FromRow)]
pub struct BaselineRow {
    pub key_text: String,
    pub source_fingerprint: Option<String>,
    pub target_fingerprint: Option<String>,
}

/// A ledger row to append with the baseline of its key after the write.
#[derive(Debug, Clone)]
pub struct LedgerAppend {
    pub row: LedgerRow,
    /// `None` removes the baseline of the key.
    pub baseline: Option<BaselineRow>,
}

/// Appends ledger rows and applies their baselines in one transaction.
///
/// Returns the assigned sequences.
pub async fn append_ledger_rows(pool: &PgPool, appends: &[LedgerAppend]) -> sqlx::Result<Vec<i64>> {
    let mut tx = pool.begin().await?;
    let mut sequences = Vec::with_capacity(appends.len());

    for LedgerAppend { row, baseline } in appends {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            insert into sync.ledger (
                job_id, table_name, primary_key, key_text, operation, previous_value, new_value,
                previous_baseline, baseline, origin, actor, applied_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            returning sequence
            "#,
        )
        .bind(row.job_id)
        .bind(&row.table_name)
        .bind(&row.primary_key)
        .bind(&row.key_text)
        .bind(&row.operation)
        .bind(&row.previous_value)
        .bind(&row.new_value)
        .bind(&row.previous_baseline)
        .bind(&row.baseline)
        .bind(&row.origin)
        .bind(&row.actor)
        .bind(row.applied_at)
        .fetch_one(&mut *tx)
        .await?;

        apply_row_baselines(&mut tx, &row.table_name, &row.key_text, baseline.as_ref()).await?;

        sequences.push(sequence);
    }

    tx.commit().await?;

    Ok(sequences)
}

async fn apply_row_baselines(
    tx: &mut Transaction<'_, Postgres>,
    table_name: &str,
    key_text: &str,
    baseline: Option<&BaselineRow>,
) -> sqlx::Result<()> {
    match baseline {
        Some(baseline) => {
            sqlx::query(
                r#"
                insert into sync.baselines (table_name, key_text, source_fingerprint, target_fingerprint, updated_at)
                values ($1, $2, $3, $4, now())
                on conflict (table_name, key_text) do update
                set source_fingerprint = excluded.source_fingerprint,
                    target_fingerprint = excluded.target_fingerprint,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(table_name)
            .bind(key_text)
            .bind(&baseline.source_fingerprint)
            .bind(&baseline.target_fingerprint)
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                delete from sync.baselines where table_name = $1 and key_text = $2
                "#,
            )
            .bind(table_name)
            .bind(key_text)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

/// Returns the ledger of a job in append order.
pub async fn get_ledger_rows(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Vec<LedgerRow>> {
    sqlx::query_as::<_, LedgerRow>(
        r#"
        select sequence, job_id, table_name, primary_key, key_text, operation, previous_value,
            new_value, previous_baseline, baseline, origin, actor, applied_at
        from sync.ledger
        where job_id = $1
        order by sequence
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Deletes ledger rows applied before `cutoff` and moves the purge watermark forward.
///
/// Returns the number of deleted rows per job.
pub async fn purge_ledger_rows(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> sqlx::Result<BTreeMap<Uuid, u64>> {
    let mut tx = pool.begin().await?;

    let job_ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        delete from sync.ledger where applied_at < $1 returning job_id
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into sync.ledger_watermark (id, purged_before)
        values (true, $1)
        on conflict (id) do update
        set purged_before = greatest(sync.ledger_watermark.purged_before, excluded.purged_before)
        "#,
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let mut purged = BTreeMap::new();
    for job_id in job_ids {
        *purged.entry(job_id).or_insert(0) += 1;
    }

    Ok(purged)
}

pub async fn get_purge_watermark(pool: &PgPool) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar(
        r#"
        select purged_before from sync.ledger_watermark where id = true
        "#,
    )
    .fetch_optional(pool)
    .await
}

pub async fn get_baselines(
    pool: &PgPool,
    table_name: &str,
    key_texts: &[String],
) -> sqlx::Result<Vec<BaselineRow>> {
    sqlx::query_as::<_, BaselineRow>(
        r#"
        select key_text, source_fingerprint, target_fingerprint
        from sync.baselines
        where table_name = $1 and key_text = any($2)
        "#,
    )
    .bind(table_name)
    .bind(key_texts)
    .fetch_all(pool)
    .await
}

/// Upserts baselines of keys that were reconciled without a write.
pub async fn upsert_baselines(
    pool: &PgPool,
    table_name: &str,
    baselines: &[BaselineRow],
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    for baseline in baselines {
        apply_row_baselines(&mut tx, table_name, &baseline.key_text, Some(baseline)).await?;
    }

    tx.commit().await?;

    Ok(())
}
