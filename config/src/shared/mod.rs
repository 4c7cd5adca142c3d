//! Shared configuration types for the sync engine and the `syncer` binary.

mod base;
mod batch;
mod connection;
mod state_store;
mod sync;
mod syncer;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use connection::{
    IntoConnectOptions, PgConnectionConfig, PgConnectionConfigWithoutSecrets, PgConnectionOptions,
    SYNC_CONNECTOR_OPTIONS, SYNC_MIGRATION_OPTIONS, SYNC_STATE_OPTIONS, TlsConfig,
};
pub use state_store::StateStoreConfig;
pub use sync::{
    ConflictStrategy, DetectionStrategy, RetryConfig, RollbackConfig, SyncConfig,
};
pub use syncer::SyncerConfig;
