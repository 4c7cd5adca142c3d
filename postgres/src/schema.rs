use std::fmt;
use std::str::FromStr;

use pg_escape::quote_identifier;
use sqlx::{PgPool, prelude::FromRow};
use thiserror::Error;

/// A schema qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the name quoted for direct use in SQL.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid table name `{0}`, expected `table` or `schema.table`")]
pub struct ParseTableNameError(String);

impl FromStr for TableName {
    type Err = ParseTableNameError;

    /// Parses `table` (in `public`) or `schema.table`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(TableName::new("public", *name)),
            [schema, name] if !schema.is_empty() && !name.is_empty() => {
                Ok(TableName::new(*schema, *name))
            }
            _ => Err(ParseTableNameError(s.to_string())),
        }
    }
}

/// Quotes a column name for direct use in SQL.
pub fn quote_column(name: &str) -> String {
    quote_identifier(name).into_owned()
}

/// A column as described by the catalog.
#[derive(Debug, Clone, FromRow)]
pub struct ColumnRow {
    pub name: String,
    /// Type as reported by `information_schema.columns.data_type`.
    pub data_type: String,
    pub nullable: bool,
    /// One based position of the column in the primary key.
    pub primary_key_position: Option<i32>,
}

/// Returns the columns of `table` ordered by their position, empty if the table does not exist.
pub async fn get_table_columns(pool: &PgPool, table: &TableName) -> sqlx::Result<Vec<ColumnRow>> {
    sqlx::query_as::<_, ColumnRow>(
        r#"
        select
            c.column_name::text as name,
            c.data_type::text as data_type,
            c.is_nullable = 'YES' as nullable,
            (
                select k.ordinal_position::int4
                from information_schema.table_constraints t
                join information_schema.key_column_usage k
                    on k.constraint_name = t.constraint_name
                    and k.constraint_schema = t.constraint_schema
                where t.constraint_type = 'PRIMARY KEY'
                    and t.table_schema = c.table_schema
                    and t.table_name = c.table_name
                    and k.column_name = c.column_name
            ) as primary_key_position
        from information_schema.columns c
        where c.table_schema = $1 and c.table_name = $2
        order by c.ordinal_position
        "#,
    )
    .bind(&table.schema)
    .bind(&table.name)
    .fetch_all(pool)
    .await
}
