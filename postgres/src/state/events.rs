use chrono::{DateTime, Utc};
use sqlx::{PgPool, prelude::FromRow};
use uuid::Uuid;

/// A row of `sync.errors`.
#[derive(Debug, Clone, FromRow)]
pub struct ErrorRow {
    pub job_id: Uuid,
    pub table_name: Option<String>,
    pub primary_key: Option<serde_json::Value>,
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// A row of `sync.audit_events`.
#[derive(Debug, Clone, FromRow)]
pub struct AuditEventRow {
    pub job_id: Uuid,
    pub table_name: Option<String>,
    pub event_type: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_error(pool: &PgPool, error: &ErrorRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into sync.errors (job_id, table_name, primary_key, kind, message, occurred_at)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(error.job_id)
    .bind(&error.table_name)
    .bind(&error.primary_key)
    .bind(&error.kind)
    .bind(&error.message)
    .bind(error.occurred_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_errors(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Vec<ErrorRow>> {
    sqlx::query_as::<_, ErrorRow>(
        r#"
        select job_id, table_name, primary_key, kind, message, occurred_at
        from sync.errors
        where job_id = $1
        order by id
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

pub async fn insert_audit_event(pool: &PgPool, event: &AuditEventRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into sync.audit_events (job_id, table_name, event_type, message, detail, created_at)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(event.job_id)
    .bind(&event.table_name)
    .bind(&event.event_type)
    .bind(&event.message)
    .bind(&event.detail)
    .bind(event.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_audit_events(pool: &PgPool, job_id: Uuid) -> sqlx::Result<Vec<AuditEventRow>> {
    sqlx::query_as::<_, AuditEventRow>(
        r#"
        select job_id, table_name, event_type, message, detail, created_at
        from sync.audit_events
        where job_id = $1
        order by id
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}
