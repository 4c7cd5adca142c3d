use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use config::shared::{PgConnectionConfig, SYNC_CONNECTOR_OPTIONS};
use postgres::db::connect_to_database;
use postgres::schema::{
    ColumnRow, ParseTableNameError, TableName, get_table_columns, quote_column,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::debug;

use crate::connector::{Connector, PageRequest, RowWrite, Side, Target};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::schema::{ColumnSchema, ColumnType, TableSchema};
use crate::types::{PrimaryKey, RowImage, TableRow, Value};
use crate::{bail, sync_error};

/// Maximum number of bind parameters Postgres accepts in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

fn parse_table_name(table: &str) -> SyncResult<TableName> {
    table
        .parse()
        .map_err(|err: ParseTableNameError| {
            sync_error!(ErrorKind::ConfigError, "Invalid table name", err)
        })
}

/// Classifies an [`sqlx::Error`] raised while talking to the source or the target.
pub fn map_sqlx_error(err: sqlx::Error, side: Side) -> SyncError {
    let kind = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => side.connection_error(),
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // unique, foreign key, not null and check violations
            Some("23505" | "23503" | "23502" | "23514") => ErrorKind::ConstraintViolation,
            Some("42P01") => ErrorKind::MissingTable,
            Some(code) if code.starts_with("08") => side.connection_error(),
            _ => side.query_error(),
        },
        _ => side.query_error(),
    };

    let detail = err.to_string();
    sync_error!(kind, "Database operation failed", detail, source: err)
}

fn column_type(data_type: &str) -> ColumnType {
    match data_type {
        "boolean" => ColumnType::Bool,
        "smallint" | "integer" | "bigint" => ColumnType::Integer,
        "real" | "double precision" | "numeric" => ColumnType::Number,
        "text" | "character varying" | "character" | "uuid" | "citext" => ColumnType::Text,
        "timestamp with time zone" | "timestamp without time zone" | "date" => {
            ColumnType::Timestamp
        }
        other => ColumnType::Unsupported(other.to_string()),
    }
}

/// Cast applied when reading a column so it decodes into a [`Value`].
fn read_cast(column_type: &ColumnType) -> &'static str {
    match column_type {
        ColumnType::Bool => "bool",
        ColumnType::Integer => "int8",
        ColumnType::Number => "float8",
        ColumnType::Timestamp => "timestamptz",
        ColumnType::Text | ColumnType::Unsupported(_) => "text",
    }
}

/// A table resolved against the catalog.
#[derive(Debug)]
struct PgTable {
    name: TableName,
    schema: TableSchema,
    /// Catalog type of every column, used to cast bound parameters.
    data_types: HashMap<String, String>,
}

impl PgTable {
    fn from_columns(table: &str, name: TableName, rows: Vec<ColumnRow>) -> Self {
        let mut keys: Vec<(i32, ColumnSchema)> = Vec::new();
        let mut values = Vec::new();
        let mut data_types = HashMap::new();

        for row in rows {
            data_types.insert(row.name.clone(), row.data_type.clone());
            let column_type = column_type(&row.data_type);
            match row.primary_key_position {
                Some(position) => keys.push((position, ColumnSchema::key(row.name, column_type))),
                None => values.push(ColumnSchema::new(row.name, column_type, row.nullable)),
            }
        }

        keys.sort_by_key(|(position, _)| *position);
        let mut columns: Vec<ColumnSchema> = keys.into_iter().map(|(_, column)| column).collect();
        columns.extend(values);

        Self {
            name,
            schema: TableSchema::new(table, columns),
            data_types,
        }
    }

    fn select_list(&self) -> String {
        self.schema
            .columns
            .iter()
            .map(|column| {
                format!(
                    "{}::{}",
                    quote_column(&column.name),
                    read_cast(&column.column_type)
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn param(&self, column: &str, index: usize) -> String {
        match self.data_types.get(column) {
            Some(data_type) => format!("${index}::{data_type}"),
            None => format!("${index}"),
        }
    }

    fn key_tuple(&self) -> String {
        let keys: Vec<String> = self
            .schema
            .key_columns()
            .iter()
            .map(|column| quote_column(column))
            .collect();

        format!("({})", keys.join(", "))
    }

    /// Renders a parenthesized parameter tuple for a key starting at `first`.
    fn key_params(&self, first: usize) -> String {
        let params: Vec<String> = self
            .schema
            .key_columns()
            .iter()
            .enumerate()
            .map(|(offset, column)| self.param(column, first + offset))
            .collect();

        format!("({})", params.join(", "))
    }

    fn decode(&self, row: &PgRow) -> Result<TableRow, sqlx::Error> {
        let mut key = Vec::new();
        let mut values = RowImage::new();

        for (index, column) in self.schema.columns.iter().enumerate() {
            let value = decode_value(row, index, &column.column_type)?;
            if column.primary_key {
                key.push(value);
            } else {
                values.insert(column.name.clone(), value);
            }
        }

        Ok(TableRow::new(PrimaryKey::new(key), values))
    }
}

fn decode_value(row: &PgRow, index: usize, column_type: &ColumnType) -> Result<Value, sqlx::Error> {
    let value = match column_type {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(index)?.into(),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(index)?.into(),
        ColumnType::Number => row.try_get::<Option<f64>, _>(index)?.into(),
        ColumnType::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(index)?.into(),
        ColumnType::Text | ColumnType::Unsupported(_) => {
            row.try_get::<Option<String>, _>(index)?.into()
        }
    };

    Ok(value)
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(value) => query.bind(*value),
        Value::Integer(value) => query.bind(*value),
        Value::Number(value) => query.bind(*value),
        Value::Text(value) => query.bind(value.clone()),
        Value::Timestamp(value) => query.bind(*value),
    }
}

/// Connector for a Postgres database.
///
/// Table names are `table` (in `public`) or `schema.table`. Table structures are read from
/// `information_schema` and cached; [`Connector::table_schema`] always refreshes the cache.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
    side: Side,
    tables: Arc<Mutex<HashMap<String, Arc<PgTable>>>>,
}

impl PgDatabase {
    pub fn new(pool: PgPool, side: Side) -> Self {
        Self {
            pool,
            side,
            tables: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn connect(
        config: &PgConnectionConfig,
        side: Side,
        max_connections: u32,
    ) -> SyncResult<Self> {
        let pool = connect_to_database(config, &SYNC_CONNECTOR_OPTIONS, 1, max_connections)
            .await
            .map_err(|err| map_sqlx_error(err, side))?;

        Ok(Self::new(pool, side))
    }

    async fn load_table(&self, table: &str) -> SyncResult<Arc<PgTable>> {
        let name = parse_table_name(table)?;

        let columns = get_table_columns(&self.pool, &name)
            .await
            .map_err(|err| map_sqlx_error(err, self.side))?;
        if columns.is_empty() {
            bail!(
                ErrorKind::MissingTable,
                "Table does not exist",
                format!("Table '{name}' does not exist in the {}", self.side)
            );
        }

        let pg_table = Arc::new(PgTable::from_columns(table, name, columns));
        self.tables
            .lock()
            .await
            .insert(table.to_string(), pg_table.clone());
        debug!(table, side = %self.side, "loaded table structure");

        Ok(pg_table)
    }

    async fn table(&self, table: &str) -> SyncResult<Arc<PgTable>> {
        if let Some(pg_table) = self.tables.lock().await.get(table) {
            return Ok(pg_table.clone());
        }

        self.load_table(table).await
    }
}

impl Connector for PgDatabase {
    fn side(&self) -> Side {
        self.side
    }

    async fn ping(&self) -> SyncResult<()> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(err, self.side))?;

        Ok(())
    }

    async fn table_schema(&self, table: &str) -> SyncResult<TableSchema> {
        Ok(self.load_table(table).await?.schema.clone())
    }

    async fn read_page(&self, table: &str, request: PageRequest) -> SyncResult<Vec<TableRow>> {
        let pg_table = self.table(table).await?;
        let key_count = pg_table.schema.key_columns().len();

        let mut conditions = Vec::new();
        let mut next_param = 1;
        if request.after.is_some() {
            conditions.push(format!(
                "{} > {}",
                pg_table.key_tuple(),
                pg_table.key_params(next_param)
            ));
            next_param += key_count;
        }
        if let Some(filter) = &request.modified {
            conditions.push(format!(
                "{}::timestamptz > ${next_param}",
                quote_column(&filter.column)
            ));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("where {}", conditions.join(" and "))
        };
        let sql = format!(
            "select {} from {} {} order by {} limit {}",
            pg_table.select_list(),
            pg_table.name.as_quoted_identifier(),
            where_clause,
            pg_table.key_tuple().trim_matches(|c| c == '(' || c == ')'),
            request.limit
        );

        let mut query = sqlx::query(&sql);
        if let Some(after) = &request.after {
            for value in after.values() {
                query = bind_value(query, value);
            }
        }
        if let Some(filter) = &request.modified {
            query = query.bind(filter.since);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(err, self.side))?;

        rows.iter()
            .map(|row| pg_table.decode(row).map_err(|err| map_sqlx_error(err, self.side)))
            .collect()
    }

    async fn fetch_rows(&self, table: &str, keys: &[PrimaryKey]) -> SyncResult<Vec<TableRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let pg_table = self.table(table).await?;
        let key_count = pg_table.schema.key_columns().len().max(1);

        let mut fetched = Vec::with_capacity(keys.len());
        for chunk in keys.chunks((MAX_BIND_PARAMS / key_count).max(1)) {
            let tuples: Vec<String> = (0..chunk.len())
                .map(|index| pg_table.key_params(index * key_count + 1))
                .collect();
            let sql = format!(
                "select {} from {} where {} in ({})",
                pg_table.select_list(),
                pg_table.name.as_quoted_identifier(),
                pg_table.key_tuple(),
                tuples.join(", ")
            );

            let mut query = sqlx::query(&sql);
            for key in chunk {
                for value in key.values() {
                    query = bind_value(query, value);
                }
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|err| map_sqlx_error(err, self.side))?;
            for row in &rows {
                fetched.push(pg_table.decode(row).map_err(|err| map_sqlx_error(err, self.side))?);
            }
        }

        Ok(fetched)
    }
}

impl Target for PgDatabase {
    async fn apply_batch(&self, table: &str, writes: &[RowWrite]) -> SyncResult<()> {
        let pg_table = self.table(table).await?;
        let key_columns = pg_table.schema.key_columns();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| map_sqlx_error(err, self.side))?;

        for write in writes {
            match write {
                RowWrite::Upsert(row) => {
                    let columns: Vec<&String> =
                        key_columns.iter().chain(row.values.keys()).collect();
                    let params: Vec<String> = columns
                        .iter()
                        .enumerate()
                        .map(|(index, column)| pg_table.param(column, index + 1))
                        .collect();
                    let assignments: Vec<String> = row
                        .values
                        .keys()
                        .map(|column| {
                            let column = quote_column(column);
                            format!("{column} = excluded.{column}")
                        })
                        .collect();
                    let on_conflict = if assignments.is_empty() {
                        "do nothing".to_string()
                    } else {
                        format!("do update set {}", assignments.join(", "))
                    };

                    let sql = format!(
                        "insert into {} ({}) values ({}) on conflict {} {}",
                        pg_table.name.as_quoted_identifier(),
                        columns
                            .iter()
                            .map(|column| quote_column(column))
                            .collect::<Vec<_>>()
                            .join(", "),
                        params.join(", "),
                        pg_table.key_tuple(),
                        on_conflict
                    );

                    let mut query = sqlx::query(&sql);
                    for value in row.key.values().iter().chain(row.values.values()) {
                        query = bind_value(query, value);
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| map_sqlx_error(err, self.side))?;
                }
                RowWrite::Delete(key) => {
                    let sql = format!(
                        "delete from {} where {} = {}",
                        pg_table.name.as_quoted_identifier(),
                        pg_table.key_tuple(),
                        pg_table.key_params(1)
                    );

                    let mut query = sqlx::query(&sql);
                    for value in key.values() {
                        query = bind_value(query, value);
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| map_sqlx_error(err, self.side))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| map_sqlx_error(err, self.side))?;

        Ok(())
    }
}
