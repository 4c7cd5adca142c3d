use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A numeric setting is outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// The timestamp detection strategy needs a modification column to compare.
    #[error("`sync.modified_column` must be set when `sync.detection_strategy` is `timestamp`")]
    MissingModifiedColumn,
    /// Automatic triggering is enabled but there is nothing to trigger.
    #[error("`sync.tables` must list at least one table when `sync.auto_trigger` is enabled")]
    AutoTriggerWithoutTables,
    /// A table name appears more than once.
    #[error("table `{0}` is listed more than once")]
    DuplicateTable(String),
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
