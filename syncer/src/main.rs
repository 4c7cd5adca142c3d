//! Syncer service binary.
//!
//! Loads the configuration, installs tracing and runs one command of the [`cli::Cli`] on a
//! multi-threaded runtime. `syncer run` keeps the engine alive until SIGINT or SIGTERM and
//! lets in-flight batches finish before exiting.

use anyhow::Context;
use clap::Parser;
use config::load_config;
use config::shared::{PgConnectionConfig, PgConnectionConfigWithoutSecrets, SyncerConfig};
use telemetry::init_tracing;
use tracing::{error, info};

use crate::cli::Cli;
use crate::core::start_syncer;

mod cli;
mod core;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config: SyncerConfig = load_config().context("loading the syncer configuration")?;
    config.validate()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config, cli))
}

async fn async_main(config: SyncerConfig, cli: Cli) -> anyhow::Result<()> {
    info!(command = ?cli.command, "starting syncer");
    log_connection("source", &config.source);
    log_connection("target", &config.target);

    if let Err(err) = start_syncer(config, cli.command).await {
        error!(error = %err, "syncer failed");
        return Err(err);
    }

    Ok(())
}

fn log_connection(side: &str, config: &PgConnectionConfig) {
    let config = PgConnectionConfigWithoutSecrets::from(config.clone());
    info!(
        side,
        host = %config.host,
        port = config.port,
        dbname = %config.name,
        username = %config.username,
        tls_enabled = config.tls.enabled,
        "database connection config"
    );
}
