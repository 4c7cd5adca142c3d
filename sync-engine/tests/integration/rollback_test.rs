use chrono::{Duration, Utc};
use sync_engine::error::ErrorKind;
use sync_engine::state::audit::AuditEventType;
use sync_engine::state::job::{JobKind, JobStatus};
use sync_engine::state::ledger::{ChangeKind, LedgerEntry, LedgerOrigin};
use sync_engine::store::ledger::LedgerStore;
use sync_engine::test_utils::fixtures::{
    TestDatabases, TestEngine, image, key, run_job, test_job_config, test_sync_config,
};
use sync_engine::test_utils::notifying_store::NotifyingStore;
use sync_engine::types::JobId;
use telemetry::init_test_tracing;

/// Syncs rows 1 and 2 with value "A", then runs a job that updates row 1, deletes row 2 and
/// inserts row 3. Returns that second job.
async fn changed(
    databases: &TestDatabases,
    engine: &TestEngine,
) -> JobId {
    databases
        .seed_source("items", &[(1, "A"), (2, "A")])
        .await
        .unwrap();
    run_job(engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    databases.seed_source("items", &[(1, "B"), (3, "N")]).await.unwrap();
    databases.source.delete_row("items", &key(2)).await.unwrap();
    let view = run_job(engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);

    view.job.id
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_restores_every_row_the_job_touched() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let cutoff = Utc::now();
    let job_id = changed(&databases, &engine).await;
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("B")));
    assert_eq!(databases.target.row("items", &key(2)).await, None);
    assert_eq!(databases.target.row("items", &key(3)).await, Some(image("N")));

    let summary = engine.rollback(job_id, cutoff, "alice").await.unwrap();

    assert_eq!(summary.total(), 3);
    assert_eq!(summary.reverted.get("items"), Some(&3));
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("A")));
    assert_eq!(databases.target.row("items", &key(2)).await, Some(image("A")));
    assert_eq!(databases.target.row("items", &key(3)).await, None);

    let entries = store.entries_for_job(job_id).await.unwrap();
    let reversals: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|entry| entry.origin == LedgerOrigin::Rollback)
        .collect();
    assert_eq!(reversals.len(), 3);
    assert!(reversals.iter().all(|entry| entry.actor == "alice"));

    let view = engine.get_job(job_id).await.unwrap();
    assert!(view.job.rolled_back_at.is_some());
    assert!(
        view.audit
            .iter()
            .any(|event| event.event_type == AuditEventType::RollbackCompleted)
    );

    // With the source back at its earlier state nothing is left to sync.
    databases.seed_source("items", &[(1, "A"), (2, "A")]).await.unwrap();
    databases.source.delete_row("items", &key(3)).await.unwrap();
    let after = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    assert_eq!(after.progress.records_total, 0);
    assert!(store.entries_for_job(after.job.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_only_reverts_writes_after_the_cutoff() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let job_id = changed(&databases, &engine).await;

    let summary = engine
        .rollback(job_id, Utc::now(), "alice")
        .await
        .unwrap();

    assert_eq!(summary.total(), 0);
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("B")));
    assert!(
        store
            .entries_for_job(job_id)
            .await
            .unwrap()
            .iter()
            .all(|entry| entry.origin == LedgerOrigin::Sync)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn a_job_is_rolled_back_at_most_once() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());
    let cutoff = Utc::now();
    let job_id = changed(&databases, &engine).await;

    engine.rollback(job_id, cutoff, "alice").await.unwrap();
    let err = engine.rollback(job_id, cutoff, "alice").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("A")));
}

#[tokio::test(flavor = "multi_thread")]
async fn cutoffs_outside_the_retention_window_are_rejected() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());
    let job_id = changed(&databases, &engine).await;

    let retention_days = test_job_config().rollback.retention_days;
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days) + 1);
    let err = engine.rollback(job_id, cutoff, "alice").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RetentionExpired);
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("B")));
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_is_refused_when_disabled() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());
    let mut config = test_job_config();
    config.rollback.enabled = false;
    let cutoff = Utc::now();

    let view = run_job(&engine, JobKind::Full, &["items"], config)
        .await
        .unwrap();
    let err = engine
        .rollback(view.job.id, cutoff, "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RollbackDisabled);
    assert_eq!(databases.target.row("items", &key(1)).await, Some(image("A")));

    let err = engine
        .rollback(JobId::new(), cutoff, "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn purged_entries_can_no_longer_be_rolled_back() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let job_id = changed(&databases, &engine).await;

    let retention_days = i64::from(test_sync_config().rollback.retention_days);
    let expired = Utc::now() - Duration::days(retention_days + 2);
    store
        .append_entries(vec![LedgerEntry {
            sequence: 0,
            job_id,
            table: "items".to_string(),
            key: key(9),
            operation: ChangeKind::Insert,
            previous: None,
            new: Some(image("old")),
            previous_baseline: None,
            baseline: None,
            origin: LedgerOrigin::Sync,
            actor: "sync-engine".to_string(),
            applied_at: expired,
        }])
        .await
        .unwrap();

    let purged = engine.purge_ledger().await.unwrap();
    assert_eq!(purged.get(&job_id), Some(&1));
    assert_eq!(store.entries_for_job(job_id).await.unwrap().len(), 3);
    assert!(
        engine
            .get_job(job_id)
            .await
            .unwrap()
            .audit
            .iter()
            .any(|event| event.event_type == AuditEventType::LedgerPurged)
    );

    // Cutoffs before the purge watermark lost their entries.
    let purged_before = store.purged_before().await.unwrap().unwrap();
    let err = engine
        .rollback(job_id, purged_before - Duration::seconds(1), "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetentionExpired);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failed_rollback_leaves_every_table_untouched() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["accounts", "parcels"]).await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    let tables = ["accounts", "parcels"];

    for table in tables {
        databases.seed_source(table, &[(1, "A")]).await.unwrap();
    }
    run_job(&engine, JobKind::Full, &tables, test_job_config())
        .await
        .unwrap();

    let cutoff = Utc::now();
    for table in tables {
        databases.seed_source(table, &[(1, "B")]).await.unwrap();
    }
    let view = run_job(&engine, JobKind::Full, &tables, test_job_config())
        .await
        .unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
    let job_id = view.job.id;

    // Reverting parcels would give row 1 a value another target row already holds.
    databases
        .target
        .add_unique_constraint("parcels", "v")
        .await
        .unwrap();
    databases.seed_target("parcels", &[(2, "A")]).await.unwrap();

    let err = engine.rollback(job_id, cutoff, "alice").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(databases.target.row("accounts", &key(1)).await, Some(image("B")));
    assert_eq!(databases.target.row("parcels", &key(1)).await, Some(image("B")));
    assert!(
        store
            .entries_for_job(job_id)
            .await
            .unwrap()
            .iter()
            .all(|entry| entry.origin != LedgerOrigin::Rollback)
    );
    assert!(engine.get_job(job_id).await.unwrap().job.rolled_back_at.is_none());

    // Once the collision is gone the rollback goes through exactly once.
    databases.target.delete_row("parcels", &key(2)).await.unwrap();
    let summary = engine.rollback(job_id, cutoff, "alice").await.unwrap();

    assert_eq!(summary.total(), 2);
    assert_eq!(databases.target.row("accounts", &key(1)).await, Some(image("A")));
    assert_eq!(databases.target.row("parcels", &key(1)).await, Some(image("A")));
    let reversals = store
        .entries_for_job(job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.origin == LedgerOrigin::Rollback)
        .count();
    assert_eq!(reversals, 2);
}
