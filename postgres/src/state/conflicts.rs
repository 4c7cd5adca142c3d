use chrono::{DateTime, Utc};
use sqlx::{PgPool, prelude::FromRow};
use uuid::Uuid;

/// A row of `sync.conflicts`.
#[derive(Debug, Clone, FromRow)]
pub struct ConflictRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub table_name: String,
    pub primary_key: Option<serde_json::Value>,
    pub kind: String,
    pub status: String,
    pub source_value: Option<serde_json::Value>,
    pub target_value: Option<serde_json::Value>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub target_modified_at: Option<DateTime<Utc>>,
    pub description: String,
    pub detail: Option<serde_json::Value>,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<String>,
    pub resolved_value: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

const CONFLICT_COLUMNS: &str = "id, job_id, table_name, primary_key, kind, status, source_value, \
    target_value, source_modified_at, target_modified_at, description, detail, detected_at, \
    resolution, resolved_value, resolved_by, resolved_at";

/// Inserts a conflict unless a pending one of the same kind already exists for the same
/// job, table and key. Returns whether the row was inserted.
pub async fn insert_conflict_if_absent(pool: &PgPool, conflict: &ConflictRow) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        insert into sync.conflicts (
            id, job_id, table_name, primary_key, kind, status, source_value, target_value,
            source_modified_at, target_modified_at, description, detail, detected_at,
            resolution, resolved_value, resolved_by, resolved_at
        )
        select $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
        where not exists (
            select 1 from sync.conflicts
            where job_id = $2
                and table_name = $3
                and kind = $5
                and status = 'pending'
                and primary_key is not distinct from $4
        )
        "#,
    )
    .bind(conflict.id)
    .bind(conflict.job_id)
    .bind(&conflict.table_name)
    .bind(&conflict.primary_key)
    .bind(&conflict.kind)
    .bind(&conflict.status)
    .bind(&conflict.source_value)
    .bind(&conflict.target_value)
    .bind(conflict.source_modified_at)
    .bind(conflict.target_modified_at)
    .bind(&conflict.description)
    .bind(&conflict.detail)
    .bind(conflict.detected_at)
    .bind(&conflict.resolution)
    .bind(&conflict.resolved_value)
    .bind(&conflict.resolved_by)
    .bind(conflict.resolved_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_conflict(
    pool: &PgPool,
    job_id: Uuid,
    conflict_id: Uuid,
) -> sqlx::Result<Option<ConflictRow>> {
    sqlx::query_as::<_, ConflictRow>(&format!(
        "select {CONFLICT_COLUMNS} from sync.conflicts where job_id = $1 and id = $2"
    ))
    .bind(job_id)
    .bind(conflict_id)
    .fetch_optional(pool)
    .await
}

/// Returns the conflicts of a job in detection order.
pub async fn list_conflicts(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Vec<ConflictRow>> {
    sqlx::query_as::<_, ConflictRow>(&format!(
        "select {CONFLICT_COLUMNS} from sync.conflicts where job_id = $1 order by detected_at, id"
    ))
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Marks a pending conflict as resolved. Returns `false` if it was not pending anymore.
pub async fn resolve_conflict(
    pool: &PgPool,
    conflict_id: Uuid,
    resolution: &str,
    resolved_value: Option<&serde_json::Value>,
    resolved_by: &str,
    resolved_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update sync.conflicts
        set status = 'resolved', resolution = $2, resolved_value = $3, resolved_by = $4, resolved_at = $5
        where id = $1 and status = 'pending'
        "#,
    )
    .bind(conflict_id)
    .bind(resolution)
    .bind(resolved_value)
    .bind(resolved_by)
    .bind(resolved_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Returns the keys of the pending data and constraint conflicts of a job's table.
pub async fn get_pending_conflict_keys(
    pool: &PgPool,
    job_id: Uuid,
    table_name: &str,
) -> sqlx::Result<Vec<serde_json::Value>> {
    sqlx::query_scalar(
        r#"
        select primary_key from sync.conflicts
        where job_id = $1 and table_name = $2 and status = 'pending' and primary_key is not null
        "#,
    )
    .bind(job_id)
    .bind(table_name)
    .fetch_all(pool)
    .await
}

/// Sets the conflict count of a table task to its number of pending conflicts.
pub async fn refresh_conflict_count(
    pool: &PgPool,
    job_id: Uuid,
    table_name: &str,
) -> sqlx::Result<i64> {
    let count: Option<i64> = sqlx::query_scalar(
        r#"
        update sync.table_tasks t
        set conflict_count = (
            select count(*) from sync.conflicts c
            where c.job_id = t.job_id and c.table_name = t.table_name and c.status = 'pending'
        )
        where t.job_id = $1 and t.table_name = $2
        returning t.conflict_count
        "#,
    )
    .bind(job_id)
    .bind(table_name)
    .fetch_optional(pool)
    .await?;

    Ok(count.unwrap_or(0))
}
