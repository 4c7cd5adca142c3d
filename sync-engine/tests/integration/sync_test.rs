use sync_engine::error::ErrorKind;
use sync_engine::state::audit::AuditEventType;
use sync_engine::schema::{ColumnSchema, ColumnType, SchemaMismatch, TableSchema};
use sync_engine::state::conflict::ConflictKind;
use sync_engine::state::job::{JobKind, JobStatus};
use sync_engine::state::ledger::{ChangeKind, LedgerOrigin, SyncBaseline};
use sync_engine::state::table::TableStatus;
use sync_engine::store::ledger::LedgerStore;
use sync_engine::test_utils::fixtures::{
    TestDatabases, image, key, run_job, table_schema, test_job_config, test_sync_config,
};
use sync_engine::test_utils::notifying_store::NotifyingStore;
use sync_engine::types::Fingerprint;
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn rows_equal_on_both_sides_produce_no_operations() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(7, "A")]).await.unwrap();
    databases.seed_target("items", &[(7, "A")]).await.unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let first = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    let second = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    for view in [&first, &second] {
        assert_eq!(view.job.status, JobStatus::Completed);
        assert_eq!(view.progress.records_total, 0);
        assert!(view.conflicts.is_empty());
        assert!(store.entries_for_job(view.job.id).await.unwrap().is_empty());
    }

    let baselines = store.get_baselines("items", &[key(7)]).await.unwrap();
    assert_eq!(
        baselines.get(&key(7)),
        Some(&SyncBaseline::settled(Fingerprint::of(&image("A"), None)))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_update_is_applied_and_recorded_in_the_ledger() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(7, "A")]).await.unwrap();
    databases.seed_target("items", &[(7, "A")]).await.unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    databases.seed_source("items", &[(7, "B")]).await.unwrap();
    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert!(view.conflicts.is_empty());
    assert_eq!(databases.target.row("items", &key(7)).await, Some(image("B")));

    let entries = store.entries_for_job(view.job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.operation, ChangeKind::Update);
    assert_eq!(entry.origin, LedgerOrigin::Sync);
    assert_eq!(entry.previous, Some(image("A")));
    assert_eq!(entry.new, Some(image("B")));

    let task = view.table("items").unwrap();
    assert_eq!(task.status, TableStatus::Completed);
    assert_eq!(task.records_total, 1);
    assert_eq!(task.records_processed, 1);
    assert_eq!(task.change_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_run_without_writes_is_idempotent() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items", "orders"]).await;
    databases
        .seed_source("items", &[(1, "A"), (2, "B"), (3, "C")])
        .await
        .unwrap();
    databases
        .seed_source("orders", &[(1, "X"), (2, "Y")])
        .await
        .unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let first = run_job(&engine, JobKind::Full, &["items", "orders"], test_job_config())
        .await
        .unwrap();
    assert_eq!(first.job.status, JobStatus::Completed);
    assert_eq!(first.progress.records_total, 5);
    assert_eq!(first.progress.records_processed, 5);
    assert_eq!(databases.target.rows("items").await.len(), 3);
    assert_eq!(databases.target.rows("orders").await.len(), 2);

    let second = run_job(&engine, JobKind::Full, &["items", "orders"], test_job_config())
        .await
        .unwrap();
    assert_eq!(second.job.status, JobStatus::Completed);
    assert_eq!(second.progress.records_total, 0);
    assert!(store.entries_for_job(second.job.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn pages_larger_than_a_batch_are_fully_synced() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let rows: Vec<(i64, String)> = (1..=35).map(|id| (id, format!("row {id}"))).collect();
    let rows: Vec<(i64, &str)> = rows.iter().map(|(id, v)| (*id, v.as_str())).collect();
    databases.seed_source("items", &rows).await.unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(databases.target.rows("items").await.len(), 35);
    assert_eq!(view.progress.records_processed, 35);
}

#[tokio::test(flavor = "multi_thread")]
async fn source_deletes_only_remove_rows_the_engine_synced() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases
        .seed_source("items", &[(1, "A"), (2, "B")])
        .await
        .unwrap();
    databases.seed_target("items", &[(9, "target only")]).await.unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    databases.source.delete_row("items", &key(2)).await.unwrap();
    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(databases.target.row("items", &key(2)).await, None);
    assert_eq!(
        databases.target.row("items", &key(9)).await,
        Some(image("target only"))
    );

    let entries = store.entries_for_job(view.job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, ChangeKind::Delete);
    assert_eq!(entries[0].previous, Some(image("B")));
    assert_eq!(entries[0].new, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_writes_become_constraint_conflicts() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases
        .target
        .add_unique_constraint("items", "v")
        .await
        .unwrap();
    databases.seed_target("items", &[(2, "X")]).await.unwrap();
    databases
        .seed_source("items", &[(1, "X"), (3, "Y")])
        .await
        .unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(databases.target.row("items", &key(1)).await, None);
    assert_eq!(databases.target.row("items", &key(3)).await, Some(image("Y")));

    let pending: Vec<_> = view.pending_conflicts().collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ConflictKind::Constraint);
    assert_eq!(pending[0].key, Some(key(1)));
    assert_eq!(pending[0].source_value, Some(image("X")));
    assert_eq!(view.table("items").unwrap().conflict_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn incompatible_schemas_fail_the_table_with_a_schema_conflict() {
    init_test_tracing();
    let mut source_schema = table_schema("items");
    source_schema
        .columns
        .push(ColumnSchema::new("extra", ColumnType::Text, true));
    let databases = TestDatabases::with_schemas(vec![table_schema("items")]).await;
    databases.source.create_table(source_schema.clone()).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.table("items").unwrap().status, TableStatus::Failed);
    assert!(databases.target.rows("items").await.is_empty());

    let pending: Vec<_> = view.pending_conflicts().collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ConflictKind::Schema);
    assert_eq!(pending[0].key, None);
    let expected = vec![SchemaMismatch::MissingColumn {
        column: "extra".to_string(),
    }];
    assert_eq!(pending[0].schema_mismatches, expected);

    let report = engine
        .get_schema_report(view.job.id, Some("items"))
        .await
        .unwrap();
    assert_eq!(report.len(), 1);
    assert!(!report[0].is_compatible());
    assert_eq!(report[0].mismatches, expected);

    let err = engine
        .get_schema_report(view.job.id, Some("orders"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TableNotInJob);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failed_table_fails_the_job_but_keeps_the_others_completed() {
    init_test_tracing();
    let mut source_schema = table_schema("parcels");
    source_schema
        .columns
        .push(ColumnSchema::new("extra", ColumnType::Text, true));
    let databases = TestDatabases::with_tables(&["accounts", "parcels"]).await;
    databases.source.create_table(source_schema).await;
    databases.seed_source("accounts", &[(1, "A")]).await.unwrap();
    databases.seed_source("parcels", &[(1, "P")]).await.unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(
        &engine,
        JobKind::Full,
        &["accounts", "parcels"],
        test_job_config(),
    )
    .await
    .unwrap();

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.table("accounts").unwrap().status, TableStatus::Completed);
    assert_eq!(view.table("parcels").unwrap().status, TableStatus::Failed);
    assert_eq!(databases.target.row("accounts", &key(1)).await, Some(image("A")));
    assert!(databases.target.rows("parcels").await.is_empty());

    let failed_event = view
        .audit
        .iter()
        .find(|event| event.event_type == AuditEventType::JobFailed)
        .unwrap();
    assert!(failed_event.message.contains("parcels"));
    assert!(!failed_event.message.contains("accounts"));
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_report_flags_missing_tables() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.source.create_table(table_schema("orders")).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items", "orders"], test_job_config())
        .await
        .unwrap();
    assert_eq!(view.table("items").unwrap().status, TableStatus::Completed);
    assert_eq!(view.table("orders").unwrap().status, TableStatus::Failed);

    let report = engine.get_schema_report(view.job.id, None).await.unwrap();
    assert_eq!(report.len(), 2);
    let items = report.iter().find(|report| report.table == "items").unwrap();
    assert!(items.is_compatible());
    let orders = report.iter().find(|report| report.table == "orders").unwrap();
    assert!(matches!(
        orders.mismatches.as_slice(),
        [SchemaMismatch::MissingTable { .. }]
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn counters_never_exceed_their_totals() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["a", "b", "c"]).await;
    for table in ["a", "b", "c"] {
        databases
            .seed_source(table, &[(1, "A"), (2, "B"), (3, "C")])
            .await
            .unwrap();
    }
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let job = engine
        .create_job(
            JobKind::Full,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            test_job_config(),
        )
        .await
        .unwrap();

    while engine.is_running(job.id).await {
        let view = engine.get_job(job.id).await.unwrap();
        assert!(view.progress.records_processed <= view.progress.records_total);
        assert!(view.progress.tables_processed <= view.progress.tables_total);
        for task in &view.tables {
            assert!(task.records_processed <= task.records_total);
        }
        tokio::task::yield_now().await;
    }

    let view = engine.get_job(job.id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(view.progress.tables_total, 3);
    assert_eq!(view.progress.tables_processed, 3);
    assert_eq!(view.progress.records_total, 9);
    assert_eq!(view.progress.records_processed, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_job_requests_are_rejected() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let err = engine
        .create_job(JobKind::Full, vec![], test_job_config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    let err = engine
        .create_job(
            JobKind::Full,
            vec!["items".to_string(), "items".to_string()],
            test_job_config(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    let mut config = test_job_config();
    config.batch_size = 0;
    let err = engine
        .create_job(JobKind::Full, vec!["items".to_string()], config)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    assert!(engine.list_jobs().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_target_fails_the_job_before_any_table_runs() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    databases.target.set_unavailable(true).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.table("items").unwrap().status, TableStatus::Pending);
    assert!(
        view.errors
            .iter()
            .any(|record| record.kind == format!("{:?}", ErrorKind::TargetConnectionFailed))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn composite_schema_changes_are_reported_per_column() {
    init_test_tracing();
    let target_schema = TableSchema::new(
        "items",
        vec![
            ColumnSchema::key("id", ColumnType::Integer),
            ColumnSchema::new("v", ColumnType::Integer, true),
        ],
    );
    let databases = TestDatabases::with_schemas(vec![table_schema("items")]).await;
    databases.target.create_table(target_schema).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    let report = engine.get_schema_report(view.job.id, None).await.unwrap();
    assert_eq!(
        report[0].mismatches,
        vec![SchemaMismatch::TypeMismatch {
            column: "v".to_string(),
            source: ColumnType::Text,
            target: ColumnType::Integer,
        }]
    );
}
