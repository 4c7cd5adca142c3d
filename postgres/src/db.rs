use config::shared::{IntoConnectOptions, PgConnectionConfig, PgConnectionOptions};
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Connects to a database with a bounded connection pool.
pub async fn connect_to_database(
    config: &PgConnectionConfig,
    options: &PgConnectionOptions,
    min_connections: u32,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let connect_options = config.with_db(Some(options));

    PgPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .connect_with(connect_options)
        .await
}
