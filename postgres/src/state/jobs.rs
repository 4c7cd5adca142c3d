use chrono::{DateTime, Utc};
use sqlx::{PgPool, prelude::FromRow};
use uuid::Uuid;

/// A row of `sync.jobs`.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// A row of `sync.table_tasks`.
#[derive(Debug, Clone, FromRow)]
pub struct TableTaskRow {
    pub job_id: Uuid,
    pub table_name: String,
    pub position: i32,
    pub status: String,
    pub records_processed: i64,
    pub records_total: i64,
    pub change_count: i64,
    pub conflict_count: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Inserts a job together with its table tasks.
pub async fn insert_job(pool: &PgPool, job: &JobRow, tasks: &[TableTaskRow]) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        insert into sync.jobs (id, kind, status, config, created_at, updated_at, rolled_back_at)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job.id)
    .bind(&job.kind)
    .bind(&job.status)
    .bind(&job.config)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.rolled_back_at)
    .execute(&mut *tx)
    .await?;

    for task in tasks {
        sqlx::query(
            r#"
            insert into sync.table_tasks (
                job_id, table_name, position, status, records_processed, records_total,
                change_count, conflict_count, started_at, finished_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.job_id)
        .bind(&task.table_name)
        .bind(task.position)
        .bind(&task.status)
        .bind(task.records_processed)
        .bind(task.records_total)
        .bind(task.change_count)
        .bind(task.conflict_count)
        .bind(task.started_at)
        .bind(task.finished_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

pub async fn get_job(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Option<JobRow>> {
    sqlx::query_as::<_, JobRow>(
        r#"
        select id, kind, status, config, created_at, updated_at, rolled_back_at
        from sync.jobs
        where id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Returns all jobs, oldest first.
pub async fn list_jobs(pool: &PgPool) -> sqlx::Result<Vec<JobRow>> {
    sqlx::query_as::<_, JobRow>(
        r#"
        select id, kind, status, config, created_at, updated_at, rolled_back_at
        from sync.jobs
        order by created_at
        "#,
    )
    .fetch_all(pool)
    .await
}

pub async fn get_table_tasks(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Vec<TableTaskRow>> {
    sqlx::query_as::<_, TableTaskRow>(
        r#"
        select job_id, table_name, position, status, records_processed, records_total,
            change_count, conflict_count, started_at, finished_at
        from sync.table_tasks
        where job_id = $1
        order by position
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Returns `false` when the job does not exist.
pub async fn update_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: &str,
    updated_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update sync.jobs
        set status = $2, updated_at = $3
        where id = $1
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_job_rolled_back(
    pool: &PgPool,
    job_id: Uuid,
    rolled_back_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update sync.jobs
        set rolled_back_at = $2, updated_at = $2
        where id = $1
        "#,
    )
    .bind(job_id)
    .bind(rolled_back_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Overwrites the status and timestamps of a table task, keeping its counters.
pub async fn update_table_task_status(
    pool: &PgPool,
    job_id: Uuid,
    table_name: &str,
    status: &str,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update sync.table_tasks
        set status = $3, started_at = coalesce($4, started_at), finished_at = $5
        where job_id = $1 and table_name = $2
        "#,
    )
    .bind(job_id)
    .bind(table_name)
    .bind(status)
    .bind(started_at)
    .bind(finished_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Atomically adds to the counters of a table task.
pub async fn increment_table_progress(
    pool: &PgPool,
    job_id: Uuid,
    table_name: &str,
    records_total: i64,
    records_processed: i64,
    change_count: i64,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        update sync.table_tasks
        set records_total = records_total + $3,
            records_processed = records_processed + $4,
            change_count = change_count + $5
        where job_id = $1 and table_name = $2
        "#,
    )
    .bind(job_id)
    .bind(table_name)
    .bind(records_total)
    .bind(records_processed)
    .bind(change_count)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_checkpoint(pool: &PgPool, table_name: &str) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar(
        r#"
        select checkpoint_at from sync.checkpoints where table_name = $1
        "#,
    )
    .bind(table_name)
    .fetch_optional(pool)
    .await
}

pub async fn set_checkpoint(
    pool: &PgPool,
    table_name: &str,
    checkpoint_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into sync.checkpoints (table_name, checkpoint_at)
        values ($1, $2)
        on conflict (table_name) do update set checkpoint_at = excluded.checkpoint_at
        "#,
    )
    .bind(table_name)
    .bind(checkpoint_at)
    .execute(pool)
    .await?;

    Ok(())
}
