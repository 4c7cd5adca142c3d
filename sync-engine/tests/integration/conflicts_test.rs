use chrono::{Duration, Utc};
use config::shared::ConflictStrategy;
use sync_engine::context::ENGINE_ACTOR;
use sync_engine::error::ErrorKind;
use sync_engine::state::conflict::{ConflictKind, ConflictStatus, ResolutionRequest};
use sync_engine::state::job::{JobConfig, JobKind, JobStatus};
use sync_engine::state::ledger::LedgerOrigin;
use sync_engine::state::table::TableStatus;
use sync_engine::store::ledger::LedgerStore;
use sync_engine::test_utils::fixtures::{
    MODIFIED_COLUMN, TestDatabases, TestEngine, image, key, run_job, test_job_config,
    test_sync_config, versioned_image, versioned_table_schema,
};
use sync_engine::test_utils::notifying_store::NotifyingStore;
use sync_engine::types::{ConflictId, JobId};
use telemetry::init_test_tracing;

/// Syncs `rows` to both sides, then changes the source to `source` and the target to `target`
/// and runs a second job that detects the conflicts.
async fn diverged(
    rows: &[(i64, &str)],
    source: &[(i64, &str)],
    target: &[(i64, &str)],
    config: JobConfig,
) -> (TestDatabases, NotifyingStore, TestEngine, JobId) {
    let databases = TestDatabases::with_tables(&["items"]).await;
    databases.seed_source("items", rows).await.unwrap();
    let store = NotifyingStore::new();
    let engine = databases.engine(test_sync_config(), store.clone());
    run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();

    databases.seed_source("items", source).await.unwrap();
    databases.seed_target("items", target).await.unwrap();
    let view = run_job(&engine, JobKind::Full, &["items"], config)
        .await
        .unwrap();

    (databases, store, engine, view.job.id)
}

#[tokio::test(flavor = "multi_thread")]
async fn independent_changes_conflict_and_source_wins_overwrites_the_target() {
    init_test_tracing();
    let (databases, store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;

    let view = engine.get_job(job_id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
    let pending: Vec<_> = view.pending_conflicts().collect();
    assert_eq!(pending.len(), 1);
    let conflict = pending[0].clone();
    assert_eq!(conflict.kind, ConflictKind::Data);
    assert_eq!(conflict.key, Some(key(7)));
    assert_eq!(conflict.source_value, Some(image("B")));
    assert_eq!(conflict.target_value, Some(image("C")));
    assert_eq!(databases.target.row("items", &key(7)).await, Some(image("C")));

    let resolved = engine
        .resolve_conflict(
            job_id,
            conflict.id,
            ResolutionRequest::new(ConflictStrategy::SourceWins, "alice"),
        )
        .await
        .unwrap();

    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(resolved.resolution, Some(ConflictStrategy::SourceWins));
    assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));
    assert!(resolved.resolved_at.is_some());
    assert_eq!(databases.target.row("items", &key(7)).await, Some(image("B")));

    let entries = store.entries_for_job(job_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].origin, LedgerOrigin::Resolution);
    assert_eq!(entries[0].previous, Some(image("C")));
    assert_eq!(entries[0].new, Some(image("B")));

    let task = engine.get_job(job_id).await.unwrap();
    let task = task.table("items").unwrap();
    assert_eq!(task.conflict_count, 0);
    assert_eq!(task.records_processed, task.records_total);
}

#[tokio::test(flavor = "multi_thread")]
async fn resolving_twice_fails_without_touching_state() {
    init_test_tracing();
    let (databases, store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;
    let conflict_id = engine
        .get_job(job_id)
        .await
        .unwrap()
        .pending_conflicts()
        .next()
        .unwrap()
        .id;

    engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::TargetWins, "alice"),
        )
        .await
        .unwrap();
    let before = engine.get_job(job_id).await.unwrap();
    let entries_before = store.entries_for_job(job_id).await.unwrap();

    let err = engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::SourceWins, "bob"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    let after = engine.get_job(job_id).await.unwrap();
    assert_eq!(after.conflicts, before.conflicts);
    assert_eq!(after.tables, before.tables);
    assert_eq!(store.entries_for_job(job_id).await.unwrap(), entries_before);
    assert_eq!(databases.target.row("items", &key(7)).await, Some(image("C")));
}

#[tokio::test(flavor = "multi_thread")]
async fn target_wins_keeps_the_target_and_settles_the_row() {
    init_test_tracing();
    let (databases, store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;
    let conflict_id = engine
        .get_job(job_id)
        .await
        .unwrap()
        .pending_conflicts()
        .next()
        .unwrap()
        .id;

    let resolved = engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::TargetWins, "alice"),
        )
        .await
        .unwrap();

    assert_eq!(resolved.resolved_value, Some(image("C")));
    assert!(store.entries_for_job(job_id).await.unwrap().is_empty());

    let next = run_job(&engine, JobKind::Full, &["items"], test_job_config())
        .await
        .unwrap();
    assert!(next.conflicts.is_empty());
    assert_eq!(next.progress.records_total, 0);
    assert_eq!(databases.target.row("items", &key(7)).await, Some(image("C")));
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_resolution_requires_a_value() {
    init_test_tracing();
    let (databases, _store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;
    let conflict_id = engine
        .get_job(job_id)
        .await
        .unwrap()
        .pending_conflicts()
        .next()
        .unwrap()
        .id;

    let err = engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::Manual, "alice"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingManualValue);
    assert_eq!(
        engine.get_job(job_id).await.unwrap().pending_conflicts().count(),
        1
    );

    let resolved = engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::manual(image("merged"), "alice"),
        )
        .await
        .unwrap();

    assert_eq!(resolved.resolution, Some(ConflictStrategy::Manual));
    assert_eq!(resolved.resolved_value, Some(image("merged")));
    assert_eq!(
        databases.target.row("items", &key(7)).await,
        Some(image("merged"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_conflicts_are_reported() {
    init_test_tracing();
    let (_databases, _store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;

    let err = engine
        .resolve_conflict(
            job_id,
            ConflictId::new(),
            ResolutionRequest::new(ConflictStrategy::SourceWins, "alice"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConflictNotFound);

    let err = engine
        .resolve_conflict(
            JobId::new(),
            ConflictId::new(),
            ResolutionRequest::new(ConflictStrategy::SourceWins, "alice"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn newest_wins_follows_the_modification_times() {
    init_test_tracing();
    let base = Utc::now() - Duration::hours(3);
    let databases = TestDatabases::with_schemas(vec![versioned_table_schema("items")]).await;
    for id in [1, 2] {
        databases
            .source
            .upsert_row("items", key(id), versioned_image("A", base))
            .await
            .unwrap();
    }
    let mut config = test_job_config();
    config.modified_column = Some(MODIFIED_COLUMN.to_string());
    let engine = databases.engine(test_sync_config(), NotifyingStore::new());
    run_job(&engine, JobKind::Full, &["items"], config.clone())
        .await
        .unwrap();

    let older = base + Duration::hours(1);
    let newer = base + Duration::hours(2);
    // Row 1 changed last in the source, row 2 last in the target.
    databases
        .source
        .upsert_row("items", key(1), versioned_image("source", newer))
        .await
        .unwrap();
    databases
        .target
        .upsert_row("items", key(1), versioned_image("target", older))
        .await
        .unwrap();
    databases
        .source
        .upsert_row("items", key(2), versioned_image("source", older))
        .await
        .unwrap();
    databases
        .target
        .upsert_row("items", key(2), versioned_image("target", newer))
        .await
        .unwrap();

    let view = run_job(&engine, JobKind::Full, &["items"], config)
        .await
        .unwrap();
    assert_eq!(view.pending_conflicts().count(), 2);

    let summary = engine
        .resolve_all(view.job.id, ConflictStrategy::NewestWins, "alice")
        .await
        .unwrap();
    assert_eq!(summary.resolved, 2);
    assert_eq!(summary.failed, 0);

    assert_eq!(
        databases.target.row("items", &key(1)).await,
        Some(versioned_image("source", newer))
    );
    assert_eq!(
        databases.target.row("items", &key(2)).await,
        Some(versioned_image("target", newer))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn newest_wins_without_timestamps_is_ambiguous() {
    init_test_tracing();
    let (_databases, _store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;
    let conflict_id = engine
        .get_job(job_id)
        .await
        .unwrap()
        .pending_conflicts()
        .next()
        .unwrap()
        .id;

    let err = engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::NewestWins, "alice"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AmbiguousResolution);
    assert_eq!(
        engine.get_job(job_id).await.unwrap().pending_conflicts().count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_all_settles_every_pending_conflict() {
    init_test_tracing();
    let (databases, _store, engine, job_id) = diverged(
        &[(1, "A"), (2, "A"), (3, "A")],
        &[(1, "B"), (2, "B"), (3, "B")],
        &[(1, "C"), (2, "C"), (3, "C")],
        test_job_config(),
    )
    .await;

    let err = engine
        .resolve_all(job_id, ConflictStrategy::Manual, "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingManualValue);

    let summary = engine
        .resolve_all(job_id, ConflictStrategy::SourceWins, "alice")
        .await
        .unwrap();
    assert_eq!(summary.resolved, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);
    for id in 1..=3 {
        assert_eq!(databases.target.row("items", &key(id)).await, Some(image("B")));
    }

    let summary = engine
        .resolve_all(job_id, ConflictStrategy::SourceWins, "alice")
        .await
        .unwrap();
    assert_eq!(summary.resolved, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_resolutions_of_one_conflict_apply_once() {
    init_test_tracing();
    let (_databases, store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], test_job_config()).await;
    let conflict_id = engine
        .get_job(job_id)
        .await
        .unwrap()
        .pending_conflicts()
        .next()
        .unwrap()
        .id;

    let single = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .resolve_conflict(
                    job_id,
                    conflict_id,
                    ResolutionRequest::new(ConflictStrategy::SourceWins, "alice"),
                )
                .await
        })
    };
    let bulk = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .resolve_all(job_id, ConflictStrategy::SourceWins, "bob")
                .await
        })
    };

    let single = single.await.unwrap();
    let bulk = bulk.await.unwrap().unwrap();

    let resolved_by_single = usize::from(single.is_ok());
    if let Err(err) = &single {
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }
    assert_eq!(resolved_by_single + bulk.resolved, 1);
    assert_eq!(store.entries_for_job(job_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn default_strategy_resolves_conflicts_during_the_run() {
    init_test_tracing();
    let mut config = test_job_config();
    config.default_conflict_strategy = ConflictStrategy::SourceWins;
    let (databases, _store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], config).await;

    let view = engine.get_job(job_id).await.unwrap();
    assert_eq!(view.conflicts.len(), 1);
    assert_eq!(view.pending_conflicts().count(), 0);
    assert_eq!(view.conflicts[0].resolved_by.as_deref(), Some(ENGINE_ACTOR));
    assert_eq!(databases.target.row("items", &key(7)).await, Some(image("B")));
}

#[tokio::test(flavor = "multi_thread")]
async fn required_resolution_keeps_the_job_running_until_conflicts_are_settled() {
    init_test_tracing();
    let mut config = test_job_config();
    config.require_conflict_resolution = true;
    let (_databases, _store, engine, job_id) =
        diverged(&[(7, "A")], &[(7, "B")], &[(7, "C")], config).await;

    let view = engine.get_job(job_id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Running);
    assert!(!engine.is_running(job_id).await);
    assert_eq!(view.table("items").unwrap().status, TableStatus::Completed);

    let conflict_id = view.pending_conflicts().next().unwrap().id;
    engine
        .resolve_conflict(
            job_id,
            conflict_id,
            ResolutionRequest::new(ConflictStrategy::SourceWins, "alice"),
        )
        .await
        .unwrap();

    assert_eq!(
        engine.get_job(job_id).await.unwrap().job.status,
        JobStatus::Completed
    );
}
