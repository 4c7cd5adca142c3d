use config::shared::{IntoConnectOptions, PgConnectionConfig, SYNC_MIGRATION_OPTIONS};
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

use crate::error::SyncResult;

/// Applies the state store migrations to the `sync` schema of the given database.
///
/// The schema is created on connect and used as `search_path`, so the `sqlx` bookkeeping
/// table lives next to the engine's tables instead of in `public`.
pub async fn migrate_state_store(connection_config: &PgConnectionConfig) -> SyncResult<()> {
    let options = connection_config.with_db(Some(&SYNC_MIGRATION_OPTIONS));

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists sync;").await?;
                conn.execute("set search_path = 'sync';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying state store migrations");

    sqlx::migrate!("./migrations").run(&pool).await?;
    pool.close().await;

    info!("state store migrations applied");

    Ok(())
}
