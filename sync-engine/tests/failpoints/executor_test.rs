use sync_engine::error::ErrorKind;
use sync_engine::failpoints::{APPLY_BATCH, DETECT_PAGE, LEDGER_APPEND};
use sync_engine::state::job::{JobKind, JobStatus};
use sync_engine::state::table::TableStatus;
use sync_engine::store::job::JobStore;
use sync_engine::store::ledger::LedgerStore;
use sync_engine::test_utils::failpoints::CustomFailScenario;
use sync_engine::test_utils::fixtures::{
    TestDatabases, image, key, run_job, test_job_config, test_sync_config,
};
use sync_engine::test_utils::notifying_store::NotifyingStore;
use telemetry::init_test_tracing;

fn recorded(kinds: &[String], kind: ErrorKind) -> bool {
    kinds.iter().any(|recorded| *recorded == format!("{kind:?}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_write_failures_are_retried() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(APPLY_BATCH, "2*return(connection)")]);
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases
        .seed_source("items", &[(1, "A"), (2, "B")])
        .await
        .unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert!(view.errors.is_empty());
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("A")));
    assert_eq!(databases.target.row("items", &key(2)).await, Some(image("B")));
    assert_eq!(store.entries_for_job(view.job.id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_target_fails_the_table_once_retries_run_out() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(APPLY_BATCH, "return(connection)")]);
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.table("items").unwrap().status, TableStatus::Failed);
    assert!(databases.target.rows("items").await.is_empty());
    assert!(store.entries_for_job(view.job.id).await.unwrap().is_empty());

    let kinds: Vec<String> = view.errors.iter().map(|record| record.kind.clone()).collect();
    assert!(recorded(&kinds, ErrorKind::TargetConnectionFailed));
    assert!(store.get_checkpoint("items").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn rows_that_keep_failing_are_recorded_as_errors() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(APPLY_BATCH, "return(query)")]);
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases
        .seed_source("items", &[(1, "A"), (2, "B")])
        .await
        .unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    let row_errors: Vec<_> = view
        .errors
        .iter()
        .filter(|record| record.key.is_some())
        .collect();
    assert_eq!(row_errors.len(), 2);
    assert!(
        row_errors
            .iter()
            .all(|record| record.kind == format!("{:?}", ErrorKind::RetryExhausted))
    );
    assert!(databases.target.rows("items").await.is_empty());

    let task = view.table("items").unwrap();
    assert_eq!(task.records_total, 2);
    assert_eq!(task.records_processed, 0);
    // Failed rows are picked up again by the next run.
    assert!(store.get_checkpoint("items").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn source_read_failures_are_retried() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(DETECT_PAGE, "1*return(source_connection)")]);
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Completed);
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("A")));
}

#[tokio::test(flavor = "multi_thread")]
async fn ledger_failures_stop_the_table() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(LEDGER_APPEND, "return(query)")]);
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    assert_eq!(view.job.status, JobStatus::Failed);
    assert_eq!(view.table("items").unwrap().status, TableStatus::Failed);
    let kinds: Vec<String> = view.errors.iter().map(|record| record.kind.clone()).collect();
    assert!(recorded(&kinds, ErrorKind::RetryExhausted));

    // The row reached the target without a ledger entry and is listed as such.
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("A")));
    assert!(store.entries_for_job(view.job.id).await.unwrap().is_empty());
    let unledgered: Vec<_> = view
        .errors
        .iter()
        .filter(|record| record.key.is_some())
        .collect();
    assert_eq!(unledgered.len(), 1);
    assert_eq!(unledgered[0].key, Some(key(1)));
    assert_eq!(unledgered[0].table.as_deref(), Some("items"));
}
