use std::collections::BTreeMap;

use anyhow::Context;
use config::shared::{StateStoreConfig, SyncerConfig};
use serde_json::json;
use sync_engine::concurrency::shutdown::create_shutdown_channel;
use sync_engine::connector::postgres::PgDatabase;
use sync_engine::connector::{Connector, Side, Target};
use sync_engine::engine::SyncEngine;
use sync_engine::migrations::migrate_state_store;
use sync_engine::scheduler::AutoSyncScheduler;
use sync_engine::state::conflict::ResolutionRequest;
use sync_engine::state::job::JobAction;
use sync_engine::store::both::memory::MemoryStore;
use sync_engine::store::both::postgres::PostgresStore;
use sync_engine::store::job::JobStore;
use sync_engine::store::ledger::LedgerStore;
use sync_engine::types::{RowImage, Value};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::cli::Command;

// Statically dispatches over the configured state store.
macro_rules! execute_dispatch {
    ($config:expr, $store:expr, $source:expr, $target:expr, $command:expr) => {{
        let engine = SyncEngine::new($config.sync.clone(), $store, $source, $target);
        execute(&engine, &$config, $command).await
    }};
}

pub async fn start_syncer(config: SyncerConfig, command: Command) -> anyhow::Result<()> {
    let max_connections = config.sync.max_parallel_tables as u32 + 1;

    let source = PgDatabase::connect(&config.source, Side::Source, max_connections)
        .await
        .context("connecting to the source database")?;
    let target = PgDatabase::connect(&config.target, Side::Target, max_connections)
        .await
        .context("connecting to the target database")?;

    match &config.state_store {
        StateStoreConfig::Memory => {
            warn!("using the in-memory state store, jobs are lost on exit");
            execute_dispatch!(config, MemoryStore::new(), source, target, command)
        }
        StateStoreConfig::Postgres { connection } => {
            migrate_state_store(connection).await?;
            let store = PostgresStore::from_config(connection);
            execute_dispatch!(config, store, source, target, command)
        }
    }
}

async fn execute<S, Src, T>(
    engine: &SyncEngine<S, Src, T>,
    config: &SyncerConfig,
    command: Command,
) -> anyhow::Result<()>
where
    S: JobStore + LedgerStore + Clone + Send + Sync + 'static,
    Src: Connector + Clone + Send + Sync + 'static,
    T: Target + Clone + Send + Sync + 'static,
{
    match command {
        Command::Run => run_service(engine, config).await?,
        Command::Sync {
            tables,
            kind,
            strategy,
            require_resolution,
        } => {
            let tables = if tables.is_empty() {
                config.sync.tables.clone()
            } else {
                tables
            };

            let mut job_config = engine.default_job_config();
            if let Some(strategy) = strategy {
                job_config.default_conflict_strategy = strategy;
            }
            job_config.require_conflict_resolution |= require_resolution;

            let job = engine.create_job(kind, tables, job_config).await?;
            info!(job_id = %job.id, "created job, waiting for it to finish");

            engine.wait_for_job(job.id).await?;
            print_json(&engine.get_job(job.id).await?)?;
        }
        Command::Resume { job_id } => {
            engine.control_job(job_id, JobAction::Resume).await?;
            engine.wait_for_job(job_id).await?;
            print_json(&engine.get_job(job_id).await?)?;
        }
        Command::Delete { job_id } => {
            print_json(&engine.control_job(job_id, JobAction::Delete).await?)?;
        }
        Command::List => print_json(&engine.list_jobs().await?)?,
        Command::Show { job_id } => print_json(&engine.get_job(job_id).await?)?,
        Command::Resolve {
            job_id,
            conflict_id,
            strategy,
            value,
            actor,
        } => {
            let request = ResolutionRequest {
                strategy,
                manual_value: value.as_deref().map(parse_row_image).transpose()?,
                actor,
            };
            print_json(
                &engine
                    .resolve_conflict(job_id, conflict_id, request)
                    .await?,
            )?;
        }
        Command::ResolveAll {
            job_id,
            strategy,
            actor,
        } => {
            let summary = engine.resolve_all(job_id, strategy, &actor).await?;
            let errors: BTreeMap<String, String> = summary
                .errors
                .iter()
                .map(|(conflict_id, err)| (conflict_id.to_string(), err.to_string()))
                .collect();

            print_json(&json!({
                "resolved": summary.resolved,
                "skipped": summary.skipped,
                "failed": summary.failed,
                "errors": errors,
            }))?;
        }
        Command::SchemaReport { job_id, table } => {
            print_json(&engine.get_schema_report(job_id, table.as_deref()).await?)?;
        }
        Command::Rollback {
            job_id,
            since,
            actor,
        } => {
            let summary = engine.rollback(job_id, since, &actor).await?;
            print_json(&json!({
                "reverted": summary.reverted,
                "total": summary.total(),
            }))?;
        }
        Command::PurgeLedger => {
            let purged: BTreeMap<String, u64> = engine
                .purge_ledger()
                .await?
                .into_iter()
                .map(|(job_id, count)| (job_id.to_string(), count))
                .collect();
            print_json(&purged)?;
        }
    }

    Ok(())
}

/// Recovers interrupted jobs, runs the scheduler if enabled and waits for a termination signal.
async fn run_service<S, Src, T>(
    engine: &SyncEngine<S, Src, T>,
    config: &SyncerConfig,
) -> anyhow::Result<()>
where
    S: JobStore + LedgerStore + Clone + Send + Sync + 'static,
    Src: Connector + Clone + Send + Sync + 'static,
    T: Target + Clone + Send + Sync + 'static,
{
    let recovered = engine.recover().await?;
    info!(jobs = recovered.len(), "recovered interrupted jobs");

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let scheduler_handle = config.sync.auto_trigger.then(|| {
        let scheduler = AutoSyncScheduler::new(
            engine.clone(),
            config.sync.sync_interval(),
            config.sync.tables.clone(),
        );
        tokio::spawn(scheduler.run(shutdown_rx))
    });

    wait_for_termination().await?;

    shutdown_tx.shutdown();
    if let Some(handle) = scheduler_handle {
        if let Err(err) = handle.await {
            warn!(error = %err, "scheduler task ended abnormally");
        }
    }

    engine.shutdown().await?;
    info!("syncer stopped");

    Ok(())
}

async fn wait_for_termination() -> anyhow::Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl+c")?;
            info!("sigint (ctrl+c) received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("sigterm received, shutting down");
        }
    }

    Ok(())
}

/// Parses a JSON object typed by an operator into a row image.
fn parse_row_image(raw: &str) -> anyhow::Result<RowImage> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).context("the manual value must be a JSON object")?;

    let mut image = RowImage::new();
    for (column, value) in object {
        let value = Value::try_from(value)
            .with_context(|| format!("invalid value for column `{column}`"))?;
        image.insert(column, value);
    }

    Ok(image)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
