use chrono::{DateTime, Duration, Utc};
use config::shared::DetectionStrategy;
use sync_engine::error::ErrorKind;
use sync_engine::state::job::{JobConfig, JobKind, JobStatus};
use sync_engine::store::job::JobStore;
use sync_engine::test_utils::fixtures::{
    MODIFIED_COLUMN, TestDatabases, key, run_job, test_job_config, test_sync_config,
    versioned_image, versioned_table_schema,
};
use sync_engine::test_utils::notifying_store::NotifyingStore;
use telemetry::init_test_tracing;

fn versioned_config(strategy: DetectionStrategy) -> JobConfig {
    let mut config = test_job_config();
    config.modified_column = Some(MODIFIED_COLUMN.to_string());
    config.detection_strategy = strategy;
    config
}

async fn seed_source(
    databases: &TestDatabases,
    rows: &[(i64, &str)],
    modified_at: DateTime<Utc>,
) {
    for (id, v) in rows {
        databases
            .source
            .upsert_row("items", key(*id), versioned_image(v, modified_at))
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn timestamp_jobs_only_scan_rows_modified_since_the_checkpoint() {
    init_test_tracing();
    let base = Utc::now() - Duration::hours(1);
    let databases = TestDatabases::with_schemas(vec![versioned_table_schema("items")]).await;
    seed_source(&databases, &[(1, "A"), (2, "A"), (3, "A")], base).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let config = versioned_config(DetectionStrategy::Timestamp);

    // Without a checkpoint the first run scans everything.
    let first = run_job(&engine, JobKind::Incremental, &["items"], config.clone())
        .await
        .unwrap();
    assert_eq!(first.job.status, JobStatus::Completed);
    assert_eq!(databases.target.rows("items").await.len(), 3);
    let checkpoint = store.get_checkpoint("items").await.unwrap().unwrap();

    // Row 1 moves past the checkpoint, row 3 changes without touching its timestamp and row 2
    // disappears from the source.
    seed_source(&databases, &[(1, "B")], Utc::now()).await;
    seed_source(&databases, &[(3, "C")], base).await;
    databases.source.delete_row("items", &key(2)).await.unwrap();

    let second = run_job(&engine, JobKind::Incremental, &["items"], config.clone())
        .await
        .unwrap();

    assert_eq!(second.job.status, JobStatus::Completed);
    assert_eq!(second.progress.records_total, 1);
    assert_eq!(
        databases.target.row("items", &key(1)).await,
        databases.source.row("items", &key(1)).await
    );
    assert_eq!(
        databases.target.row("items", &key(2)).await,
        Some(versioned_image("A", base))
    );
    assert_eq!(
        databases.target.row("items", &key(3)).await,
        Some(versioned_image("A", base))
    );
    assert!(store.get_checkpoint("items").await.unwrap().unwrap() > checkpoint);

    // A full job sees both the silent update and the delete.
    let full = run_job(&engine, JobKind::Full, &["items"], config)
        .await
        .unwrap();

    assert_eq!(full.job.status, JobStatus::Completed);
    assert_eq!(full.progress.records_total, 2);
    assert_eq!(databases.target.row("items", &key(2)).await, None);
    assert_eq!(
        databases.target.row("items", &key(3)).await,
        Some(versioned_image("C", base))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn hash_jobs_with_a_checkpoint_still_propagate_deletes() {
    init_test_tracing();
    let base = Utc::now() - Duration::hours(1);
    let databases = TestDatabases::with_schemas(vec![versioned_table_schema("items")]).await;
    seed_source(&databases, &[(1, "A"), (2, "A")], base).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let config = versioned_config(DetectionStrategy::Hash);

    run_job(&engine, JobKind::Incremental, &["items"], config.clone())
        .await
        .unwrap();
    assert!(store.get_checkpoint("items").await.unwrap().is_some());

    databases.source.delete_row("items", &key(2)).await.unwrap();
    let view = run_job(&engine, JobKind::Incremental, &["items"], config)
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(view.progress.records_total, 1);
    assert_eq!(databases.target.row("items", &key(2)).await, None);
    assert_eq!(
        databases.target.row("items", &key(1)).await,
        Some(versioned_image("A", base))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_stays_put_while_rows_fail() {
    init_test_tracing();
    let base = Utc::now() - Duration::hours(1);
    let databases = TestDatabases::with_schemas(vec![versioned_table_schema("items")]).await;
    seed_source(&databases, &[(1, "A"), (2, "A")], base).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let config = versioned_config(DetectionStrategy::Timestamp);

    run_job(&engine, JobKind::Incremental, &["items"], config.clone())
        .await
        .unwrap();
    let checkpoint = store.get_checkpoint("items").await.unwrap().unwrap();

    let modified_at = Utc::now();
    seed_source(&databases, &[(1, "B")], modified_at).await;
    // Every attempt of the only write is rejected.
    let max_attempts = test_sync_config().retry.max_attempts;
    databases
        .target
        .fail_next_writes(max_attempts, ErrorKind::TargetQueryFailed)
        .await;

    let failed = run_job(&engine, JobKind::Incremental, &["items"], config.clone())
        .await
        .unwrap();

    assert_eq!(failed.job.status, JobStatus::Completed);
    assert!(
        failed
            .errors
            .iter()
            .any(|record| record.key.is_some()
                && record.kind == format!("{:?}", ErrorKind::RetryExhausted))
    );
    assert_eq!(
        databases.target.row("items", &key(1)).await,
        Some(versioned_image("A", base))
    );
    assert_eq!(store.get_checkpoint("items").await.unwrap(), Some(checkpoint));

    // The next run still sees the row and moves the checkpoint on.
    let retried = run_job(&engine, JobKind::Incremental, &["items"], config)
        .await
        .unwrap();

    assert_eq!(retried.job.status, JobStatus::Completed);
    assert!(retried.errors.is_empty());
    assert_eq!(
        databases.target.row("items", &key(1)).await,
        Some(versioned_image("B", modified_at))
    );
    assert!(store.get_checkpoint("items").await.unwrap().unwrap() > checkpoint);
}

#[tokio::test(flavor = "multi_thread")]
async fn without_change_tracking_incremental_jobs_scan_everything() {
    init_test_tracing();
    let base = Utc::now() - Duration::hours(1);
    let databases = TestDatabases::with_schemas(vec![versioned_table_schema("items")]).await;
    seed_source(&databases, &[(1, "A"), (2, "A")], base).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let mut config = versioned_config(DetectionStrategy::Timestamp);
    config.change_tracking_enabled = false;

    run_job(&engine, JobKind::Incremental, &["items"], config.clone())
        .await
        .unwrap();
    assert!(store.get_checkpoint("items").await.unwrap().is_none());

    // Neither change moves the modification time.
    seed_source(&databases, &[(1, "B")], base).await;
    databases.source.delete_row("items", &key(2)).await.unwrap();

    let view = run_job(&engine, JobKind::Incremental, &["items"], config)
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(view.progress.records_total, 2);
    assert_eq!(
        databases.target.row("items", &key(1)).await,
        Some(versioned_image("B", base))
    );
    assert_eq!(databases.target.row("items", &key(2)).await, None);
    assert!(store.get_checkpoint("items").await.unwrap().is_none());
}
