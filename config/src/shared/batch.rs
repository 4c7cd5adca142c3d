use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batching of detection pages and target writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of rows read per detection page and written per target batch.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
}

impl BatchConfig {
    pub const DEFAULT_MAX_SIZE: usize = 1000;

    /// Upper bound for [`BatchConfig::max_size`].
    ///
    /// Key lookups bind one parameter per key column and row, and Postgres accepts at most
    /// 65535 parameters per statement.
    pub const MAX_MAX_SIZE: usize = 10_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.max_size > Self::MAX_MAX_SIZE {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_size".to_string(),
                constraint: format!("must be at most {}", Self::MAX_MAX_SIZE),
            });
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
        }
    }
}

fn default_batch_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}
