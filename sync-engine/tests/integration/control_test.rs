use std::collections::BTreeMap;

use config::shared::ConflictStrategy;
use sync_engine::error::ErrorKind;
use sync_engine::state::audit::AuditEventType;
use sync_engine::state::conflict::ResolutionRequest;
use sync_engine::state::job::{JobAction, JobKind, JobStatus, SyncJob};
use sync_engine::state::table::{TableStatus, TableSyncTask};
use sync_engine::store::job::JobStore;
use sync_engine::test_utils::fixtures::{
    TestDatabases, key, run_job, test_job_config, test_sync_config,
};
use sync_engine::test_utils::notifying_store::NotifyingStore;
use sync_engine::types::JobId;
use telemetry::init_test_tracing;

const TABLES: [&str; 5] = ["t1", "t2", "t3", "t4", "t5"];

#[tokio::test(flavor = "multi_thread")]
async fn resume_after_stop_only_syncs_incomplete_tables() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&TABLES).await;
    for table in TABLES {
        databases
            .seed_source(table, &[(1, "A"), (2, "B")])
            .await
            .unwrap();
    }
    // The last two tables block on their first read.
    databases.source.close_gate("t4").await;
    databases.source.close_gate("t5").await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let job = engine
        .create_job(
            JobKind::Full,
            TABLES.iter().map(|table| table.to_string()).collect(),
            test_job_config(),
        )
        .await
        .unwrap();

    let mut notifications = Vec::new();
    for table in ["t1", "t2", "t3"] {
        notifications.push(
            store
                .notify_on_table_status(job.id, table, TableStatus::Completed)
                .await,
        );
    }
    for table in ["t4", "t5"] {
        notifications.push(
            store
                .notify_on_table_status(job.id, table, TableStatus::Running)
                .await,
        );
    }
    for notification in &notifications {
        notification.notified().await;
    }

    let stopping = engine.control_job(job.id, JobAction::Stop).await.unwrap();
    assert_eq!(stopping.status, JobStatus::Running);
    databases.source.open_gate("t4").await;
    databases.source.open_gate("t5").await;

    let stopped = engine.wait_for_job(job.id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);

    let view = engine.get_job(job.id).await.unwrap();
    for table in ["t1", "t2", "t3"] {
        assert_eq!(view.table(table).unwrap().status, TableStatus::Completed);
        assert_eq!(databases.target.rows(table).await.len(), 2);
    }
    for table in ["t4", "t5"] {
        assert_eq!(view.table(table).unwrap().status, TableStatus::Stopped);
        assert!(databases.target.rows(table).await.is_empty());
    }

    let mut reads = BTreeMap::new();
    for table in TABLES {
        reads.insert(table, databases.source.read_calls(table).await);
    }

    let resumed = engine.control_job(job.id, JobAction::Resume).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    let finished = engine.wait_for_job(job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);

    for table in ["t1", "t2", "t3"] {
        assert_eq!(databases.source.read_calls(table).await, reads[table]);
        assert_eq!(
            store.table_status_history(job.id, table).await,
            vec![TableStatus::Pending, TableStatus::Running, TableStatus::Completed]
        );
    }
    for table in ["t4", "t5"] {
        assert!(databases.source.read_calls(table).await > reads[table]);
        assert_eq!(databases.target.rows(table).await.len(), 2);
    }

    let view = engine.get_job(job.id).await.unwrap();
    let events: Vec<AuditEventType> = view.audit.iter().map(|event| event.event_type).collect();
    assert!(events.contains(&AuditEventType::JobStopped));
    assert!(events.contains(&AuditEventType::JobResumed));
    assert_eq!(events.last(), Some(&AuditEventType::JobCompleted));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_jobs_resume_their_failed_tables() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    databases.target.set_unavailable(true).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());

    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    assert_eq!(view.job.status, JobStatus::Failed);

    databases.target.set_unavailable(false).await;
    engine
        .control_job(view.job.id, JobAction::Resume)
        .await
        .unwrap();
    let job = engine.wait_for_job(view.job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(databases.target.row("items", &key(1)).await.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_transitions_are_rejected() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());
    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);

    for action in [JobAction::Stop, JobAction::Resume] {
        let err = engine.control_job(view.job.id, action).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    let deleted = engine
        .control_job(view.job.id, JobAction::Delete)
        .await
        .unwrap();
    assert_eq!(deleted.status, JobStatus::Deleted);

    for action in [JobAction::Stop, JobAction::Resume, JobAction::Delete] {
        let err = engine.control_job(view.job.id, action).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    let err = engine
        .control_job(JobId::new(), JobAction::Stop)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicts_of_deleted_jobs_cannot_be_resolved() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(7, "A")]).await.unwrap();
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());
    run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    databases.seed_source("items", &[(7, "B")]).await.unwrap();
    databases.seed_target("items", &[(7, "C")]).await.unwrap();
    let view = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    let conflict_id = view.pending_conflicts().next().unwrap().id;

    engine
        .control_job(view.job.id, JobAction::Delete)
        .await
        .unwrap();

    let err = engine
        .resolve_conflict(
            view.job.id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::SourceWins, "alice"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_jobs_are_recovered() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items", "orders"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    databases.seed_source("orders", &[(1, "X")]).await.unwrap();
    let store = NotifyingStore::new();

    // One job crashed mid-run, another was never started.
    let interrupted = SyncJob::new(JobKind::Full, test_job_config());
    store
        .insert_job(interrupted.clone(), vec![TableSyncTask::new("items")])
        .await
        .unwrap();
    store
        .update_job_status(interrupted.id, JobStatus::Running)
        .await
        .unwrap();
    store
        .update_table_status(interrupted.id, "items", TableStatus::Running, None, None)
        .await
        .unwrap();
    let pending = SyncJob::new(JobKind::Full, test_job_config());
    store
        .insert_job(pending.clone(), vec![TableSyncTask::new("orders")])
        .await
        .unwrap();

    let engine = databases.engine(test_sync_config(), store.clone());
    let mut recovered = engine.recover().await.unwrap();
    recovered.sort();
    let mut expected = vec![interrupted.id, pending.id];
    expected.sort();
    assert_eq!(recovered, expected);

    for job_id in [interrupted.id, pending.id] {
        let job = engine.wait_for_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert!(databases.target.row("items", &key(1)).await.is_some());
    assert!(databases.target.row("orders", &key(1)).await.is_some());

    let view = engine.get_job(interrupted.id).await.unwrap();
    let events: Vec<AuditEventType> = view.audit.iter().map(|event| event.event_type).collect();
    assert!(events.contains(&AuditEventType::JobStopped));
    assert!(events.contains(&AuditEventType::JobResumed));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_waits_for_running_jobs_to_settle() {
    init_test_tracing();
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", &[(1, "A")]).await.unwrap();
    databases.source.close_gate("items").await;
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());

    let job = engine
        .create_job(JobKind::Full, vec!["items".to_string()], test_job_config())
        .await
        .unwrap();
    store
        .notify_on_table_status(job.id, "items", TableStatus::Running)
        .await
        .notified()
        .await;
    engine.control_job(job.id, JobAction::Stop).await.unwrap();

    let shutdown = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.shutdown().await })
    };
    databases.source.open_gate("items").await;
    shutdown.await.unwrap().unwrap();

    assert_eq!(
        engine.get_job(job.id).await.unwrap().job.status,
        JobStatus::Stopped
    );
    assert!(!engine.is_running(job.id).await);
    assert_eq!(
        engine.get_job(job.id).await.unwrap().table("items").unwrap().status,
        TableStatus::Stopped
    );
}
