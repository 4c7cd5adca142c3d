//! Column level table descriptions and structural compatibility checks.

use std::collections::HashMap;
use std::fmt;

use config::shared::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::connector::{Connector, Side};
use crate::error::{ErrorKind, SyncResult};
use crate::executor::retry::Backoff;

/// Column value kinds the engine can compare and copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ColumnType {
    Bool,
    Integer,
    Number,
    Text,
    Timestamp,
    /// A column type outside of the supported set, carrying the database type name.
    Unsupported(String),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => f.write_str("bool"),
            ColumnType::Integer => f.write_str("integer"),
            ColumnType::Number => f.write_str("number"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Unsupported(name) => write!(f, "unsupported({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
            primary_key: false,
        }
    }

    /// Creates a non-nullable primary key column.
    pub fn key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: true,
        }
    }
}

/// Columns of a table in ordinal order. Key columns appear in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|column| column.primary_key)
            .map(|column| column.name.clone())
            .collect()
    }

    pub fn value_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|column| !column.primary_key)
            .map(|column| column.name.clone())
            .collect()
    }
}

/// A structural difference that prevents rows from being synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mismatch")]
pub enum SchemaMismatch {
    /// The table does not exist on one side.
    MissingTable { side: Side },
    /// A source column has no counterpart in the target.
    MissingColumn { column: String },
    TypeMismatch {
        column: String,
        source: ColumnType,
        target: ColumnType,
    },
    PrimaryKeyMismatch {
        source: Vec<String>,
        target: Vec<String>,
    },
    /// A target-only column that would receive no value but rejects nulls.
    NonNullableTargetColumn { column: String },
    UnsupportedType {
        side: Side,
        column: String,
        type_name: String,
    },
    /// The configured modification column is absent from the source table.
    MissingModifiedColumn { column: String },
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaMismatch::MissingTable { side } => write!(f, "table is missing in the {side}"),
            SchemaMismatch::MissingColumn { column } => {
                write!(f, "column '{column}' is missing in the target")
            }
            SchemaMismatch::TypeMismatch {
                column,
                source,
                target,
            } => write!(
                f,
                "column '{column}' has type {source} in the source and {target} in the target"
            ),
            SchemaMismatch::PrimaryKeyMismatch { source, target } => write!(
                f,
                "primary key ({}) in the source differs from ({}) in the target",
                source.join(", "),
                target.join(", ")
            ),
            SchemaMismatch::NonNullableTargetColumn { column } => write!(
                f,
                "target-only column '{column}' is not nullable"
            ),
            SchemaMismatch::UnsupportedType {
                side,
                column,
                type_name,
            } => write!(
                f,
                "column '{column}' in the {side} has unsupported type '{type_name}'"
            ),
            SchemaMismatch::MissingModifiedColumn { column } => write!(
                f,
                "modification column '{column}' is missing in the source"
            ),
        }
    }
}

/// Compares the structure of a source and a target table.
///
/// Returns every mismatch found, an empty list means rows can be synced. When
/// `modified_column` is given it must exist in the source as a non-key column.
pub fn validate_schema(
    source: &TableSchema,
    target: &TableSchema,
    modified_column: Option<&str>,
) -> Vec<SchemaMismatch> {
    let mut mismatches = Vec::new();

    for (side, schema) in [(Side::Source, source), (Side::Target, target)] {
        for column in &schema.columns {
            if let ColumnType::Unsupported(type_name) = &column.column_type {
                mismatches.push(SchemaMismatch::UnsupportedType {
                    side,
                    column: column.name.clone(),
                    type_name: type_name.clone(),
                });
            }
        }
    }

    let source_keys = source.key_columns();
    let target_keys = target.key_columns();
    if source_keys.is_empty() || source_keys != target_keys {
        mismatches.push(SchemaMismatch::PrimaryKeyMismatch {
            source: source_keys,
            target: target_keys,
        });
    }

    let target_columns: HashMap<&str, &ColumnSchema> = target
        .columns
        .iter()
        .map(|column| (column.name.as_str(), column))
        .collect();

    for column in &source.columns {
        let Some(target_column) = target_columns.get(column.name.as_str()) else {
            mismatches.push(SchemaMismatch::MissingColumn {
                column: column.name.clone(),
            });
            continue;
        };

        let both_supported = !matches!(column.column_type, ColumnType::Unsupported(_))
            && !matches!(target_column.column_type, ColumnType::Unsupported(_));
        if both_supported && column.column_type != target_column.column_type {
            mismatches.push(SchemaMismatch::TypeMismatch {
                column: column.name.clone(),
                source: column.column_type.clone(),
                target: target_column.column_type.clone(),
            });
        }
    }

    for column in &target.columns {
        if source.column(&column.name).is_none() && !column.nullable {
            mismatches.push(SchemaMismatch::NonNullableTargetColumn {
                column: column.name.clone(),
            });
        }
    }

    if let Some(modified_column) = modified_column {
        let present = source
            .column(modified_column)
            .is_some_and(|column| !column.primary_key);
        if !present {
            mismatches.push(SchemaMismatch::MissingModifiedColumn {
                column: modified_column.to_string(),
            });
        }
    }

    mismatches
}

/// A table schema, or the mismatch explaining why it could not be loaded.
pub type LoadedSchema = Result<TableSchema, SchemaMismatch>;

/// Loads the schema of a table, retrying transient failures.
///
/// A missing table is not an error here, it is reported as a mismatch.
pub async fn load_table_schema<C>(
    connector: &C,
    table: &str,
    retry: &RetryConfig,
) -> SyncResult<LoadedSchema>
where
    C: Connector,
{
    let mut backoff = Backoff::new(retry);

    loop {
        match connector.table_schema(table).await {
            Ok(schema) => return Ok(Ok(schema)),
            Err(err) if err.kind() == ErrorKind::MissingTable => {
                return Ok(Err(SchemaMismatch::MissingTable {
                    side: connector.side(),
                }));
            }
            Err(err) => backoff.retry_or_fail(err).await?,
        }
    }
}

/// Like [`validate_schema`] for schemas that may have failed to load.
pub fn validate_loaded(
    source: &LoadedSchema,
    target: &LoadedSchema,
    modified_column: Option<&str>,
) -> Vec<SchemaMismatch> {
    match (source, target) {
        (Ok(source), Ok(target)) => validate_schema(source, target, modified_column),
        _ => [source.as_ref().err(), target.as_ref().err()]
            .into_iter()
            .flatten()
            .cloned()
            .collect(),
    }
}
