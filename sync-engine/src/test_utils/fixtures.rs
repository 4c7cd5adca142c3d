use chrono::{DateTime, Utc};
use config::shared::{BatchConfig, RetryConfig, SyncConfig};

use crate::connector::Side;
use crate::connector::memory::MemoryDatabase;
use crate::engine::{JobView, SyncEngine};
use crate::error::SyncResult;
use crate::schema::{ColumnSchema, ColumnType, TableSchema};
use crate::state::job::{JobConfig, JobKind};
use crate::test_utils::notifying_store::NotifyingStore;
use crate::types::{PrimaryKey, RowImage, Value};

pub type TestEngine = SyncEngine<NotifyingStore, MemoryDatabase, MemoryDatabase>;

/// Column tracking the last modification in [`versioned_table_schema`].
pub const MODIFIED_COLUMN: &str = "modified_at";

/// `id integer` key with a single nullable text column `v`.
pub fn table_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            ColumnSchema::key("id", ColumnType::Integer),
            ColumnSchema::new("v", ColumnType::Text, true),
        ],
    )
}

/// [`table_schema`] with an additional [`MODIFIED_COLUMN`].
pub fn versioned_table_schema(table: &str) -> TableSchema {
    let mut schema = table_schema(table);
    schema.columns.push(ColumnSchema::new(
        MODIFIED_COLUMN,
        ColumnType::Timestamp,
        true,
    ));
    schema
}

pub fn image(v: &str) -> RowImage {
    RowImage::from([("v".to_string(), Value::from(v))])
}

pub fn versioned_image(v: &str, modified_at: DateTime<Utc>) -> RowImage {
    RowImage::from([
        ("v".to_string(), Value::from(v)),
        (MODIFIED_COLUMN.to_string(), Value::from(modified_at)),
    ])
}

pub fn key(id: i64) -> PrimaryKey {
    PrimaryKey::single(id)
}

/// Engine configuration with small batches and retries fast enough for tests.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        batch: BatchConfig { max_size: 10 },
        max_parallel_tables: 5,
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..SyncConfig::default()
    }
}

pub fn test_job_config() -> JobConfig {
    JobConfig::from(&test_sync_config())
}

/// A source and a target database holding the same set of tables.
#[derive(Debug, Clone)]
pub struct TestDatabases {
    pub source: MemoryDatabase,
    pub target: MemoryDatabase,
}

impl TestDatabases {
    pub async fn with_tables(tables: &[&str]) -> Self {
        Self::with_schemas(tables.iter().map(|table| table_schema(table)).collect()).await
    }

    pub async fn with_schemas(schemas: Vec<TableSchema>) -> Self {
        let databases = Self {
            source: MemoryDatabase::new(Side::Source),
            target: MemoryDatabase::new(Side::Target),
        };

        for schema in schemas {
            databases.source.create_table(schema.clone()).await;
            databases.target.create_table(schema).await;
        }

        databases
    }

    pub async fn seed_source(&self, table: &str, rows: &[(i64, &str)]) -> SyncResult<()> {
        for (id, v) in rows {
            self.source.upsert_row(table, key(*id), image(v)).await?;
        }

        Ok(())
    }

    pub async fn seed_target(&self, table: &str, rows: &[(i64, &str)]) -> SyncResult<()> {
        for (id, v) in rows {
            self.target.upsert_row(table, key(*id), image(v)).await?;
        }

        Ok(())
    }

    pub fn engine(&self, config: SyncConfig, store: NotifyingStore) -> TestEngine {
        SyncEngine::new(config, store, self.source.clone(), self.target.clone())
    }
}

/// Creates a job, waits until its run is over and returns its view.
pub async fn run_job(
    engine: &TestEngine,
    kind: JobKind,
    tables: &[&str],
    config: JobConfig,
) -> SyncResult<JobView> {
    let job = engine
        .create_job(kind, tables.iter().map(|table| table.to_string()).collect(), config)
        .await?;
    engine.wait_for_job(job.id).await?;

    engine.get_job(job.id).await
}
