use serde::Deserialize;

use crate::Config;
use crate::shared::{PgConnectionConfig, StateStoreConfig, SyncConfig, ValidationError};

/// Complete configuration of the `syncer` service.
///
/// Does not implement [`Serialize`](serde::Serialize) so secrets are never written out.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncerConfig {
    /// System of record rows are read from.
    pub source: PgConnectionConfig,
    /// Store that is reconciled with the source.
    pub target: PgConnectionConfig,
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl SyncerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.target.validate()?;
        self.state_store.validate()?;
        self.sync.validate()
    }
}

impl Config for SyncerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["sync.tables"];
}
