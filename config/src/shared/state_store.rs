use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Where jobs, conflicts, baselines and the ledger are persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StateStoreConfig {
    /// Process local state, lost on restart.
    Memory,
    Postgres {
        #[serde(flatten)]
        connection: PgConnectionConfig,
    },
}

impl StateStoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StateStoreConfig::Memory => Ok(()),
            StateStoreConfig::Postgres { connection } => connection.validate(),
        }
    }
}
