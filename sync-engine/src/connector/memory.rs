use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use crate::connector::{Connector, PageRequest, RowWrite, Side, Target};
use crate::error::{ErrorKind, SyncResult};
use crate::schema::TableSchema;
use crate::types::{PrimaryKey, RowImage, TableRow, Value};
use crate::{bail, sync_error};

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<PrimaryKey, RowImage>,
    /// Columns whose non-null values must be unique.
    unique_columns: Vec<String>,
}

impl MemoryTable {
    fn check_row(&self, key: &PrimaryKey, values: &RowImage, side: Side) -> SyncResult<()> {
        for column in self.schema.value_columns() {
            let Some(schema) = self.schema.column(&column) else {
                continue;
            };

            if !schema.nullable && values.get(&column).is_none_or(Value::is_null) {
                bail!(
                    ErrorKind::ConstraintViolation,
                    "Not null constraint violated",
                    format!("Column '{column}' of row {key} in the {side} must not be null")
                );
            }
        }

        for column in &self.unique_columns {
            let Some(value) = values.get(column).filter(|value| !value.is_null()) else {
                continue;
            };

            let taken = self
                .rows
                .iter()
                .any(|(other_key, other)| other_key != key && other.get(column) == Some(value));
            if taken {
                bail!(
                    ErrorKind::ConstraintViolation,
                    "Unique constraint violated",
                    format!("Value {value} of column '{column}' in the {side} is already used")
                );
            }
        }

        Ok(())
    }

    fn apply(&mut self, write: &RowWrite, side: Side) -> SyncResult<()> {
        match write {
            RowWrite::Upsert(row) => {
                for column in row.values.keys() {
                    if self.schema.column(column).is_none_or(|c| c.primary_key) {
                        bail!(
                            side.query_error(),
                            "Unknown column in write",
                            format!("Table '{}' has no value column '{column}'", self.schema.name)
                        );
                    }
                }

                let mut values = self.rows.get(&row.key).cloned().unwrap_or_else(|| {
                    self.schema
                        .value_columns()
                        .into_iter()
                        .map(|column| (column, Value::Null))
                        .collect()
                });
                values.extend(row.values.clone());

                self.check_row(&row.key, &values, side)?;
                self.rows.insert(row.key.clone(), values);
            }
            RowWrite::Delete(key) => {
                self.rows.remove(key);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, MemoryTable>,
    unavailable: bool,
    /// Number of upcoming batches to reject, with the kind to reject them with.
    failing_writes: Option<(u32, ErrorKind)>,
    read_calls: HashMap<String, u64>,
    gates: HashMap<String, watch::Sender<bool>>,
}

impl Inner {
    fn table(&self, name: &str, side: Side) -> SyncResult<&MemoryTable> {
        self.tables.get(name).ok_or_else(|| missing_table(name, side))
    }

    fn check_available(&self, side: Side) -> SyncResult<()> {
        if self.unavailable {
            bail!(
                side.connection_error(),
                "Database is unreachable",
                format!("The {side} database does not accept connections")
            );
        }

        Ok(())
    }
}

fn missing_table(name: &str, side: Side) -> crate::error::SyncError {
    sync_error!(
        ErrorKind::MissingTable,
        "Table does not exist",
        format!("Table '{name}' does not exist in the {side}")
    )
}

/// In-memory database used as source or target in tests.
///
/// Besides storing rows it can simulate an unreachable database, reject upcoming batches,
/// enforce unique columns and hold readers of a table until a gate is opened.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    side: Side,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDatabase {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub async fn create_table(&self, schema: TableSchema) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
                unique_columns: Vec::new(),
            },
        );
    }

    pub async fn drop_table(&self, table: &str) {
        let mut inner = self.inner.lock().await;
        inner.tables.remove(table);
    }

    pub async fn add_unique_constraint(&self, table: &str, column: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let side = self.side;
        let table = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table, side))?;
        table.unique_columns.push(column.to_string());

        Ok(())
    }

    /// Writes a row directly, bypassing constraints and fault injection.
    pub async fn upsert_row(&self, table: &str, key: PrimaryKey, values: RowImage) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let side = self.side;
        let table = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table, side))?;
        table.rows.insert(key, values);

        Ok(())
    }

    pub async fn delete_row(&self, table: &str, key: &PrimaryKey) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        let side = self.side;
        let table = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table, side))?;
        table.rows.remove(key);

        Ok(())
    }

    pub async fn row(&self, table: &str, key: &PrimaryKey) -> Option<RowImage> {
        let inner = self.inner.lock().await;
        inner.tables.get(table)?.rows.get(key).cloned()
    }

    pub async fn rows(&self, table: &str) -> BTreeMap<PrimaryKey, RowImage> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.inner.lock().await;
        inner.unavailable = unavailable;
    }

    /// Makes the next `count` batches fail with `kind` before anything is written.
    pub async fn fail_next_writes(&self, count: u32, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.failing_writes = (count > 0).then_some((count, kind));
    }

    /// Number of pages read from `table` so far.
    pub async fn read_calls(&self, table: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner.read_calls.get(table).copied().unwrap_or_default()
    }

    /// Holds every page read of `table` until [`MemoryDatabase::open_gate`] is called.
    pub async fn close_gate(&self, table: &str) {
        let mut inner = self.inner.lock().await;
        let (tx, _) = watch::channel(false);
        inner.gates.insert(table.to_string(), tx);
    }

    pub async fn open_gate(&self, table: &str) {
        let inner = self.inner.lock().await;
        if let Some(gate) = inner.gates.get(table) {
            gate.send_replace(true);
        }
    }

    async fn wait_for_gate(&self, table: &str) {
        let gate = {
            let inner = self.inner.lock().await;
            inner.gates.get(table).map(|gate| gate.subscribe())
        };

        if let Some(mut gate) = gate {
            // A dropped gate counts as open.
            let _ = gate.wait_for(|open| *open).await;
        }
    }
}

impl Connector for MemoryDatabase {
    fn side(&self) -> Side {
        self.side
    }

    async fn ping(&self) -> SyncResult<()> {
        let inner = self.inner.lock().await;
        inner.check_available(self.side)
    }

    async fn table_schema(&self, table: &str) -> SyncResult<TableSchema> {
        let inner = self.inner.lock().await;
        inner.check_available(self.side)?;

        Ok(inner.table(table, self.side)?.schema.clone())
    }

    async fn read_page(&self, table: &str, request: PageRequest) -> SyncResult<Vec<TableRow>> {
        {
            let mut inner = self.inner.lock().await;
            *inner.read_calls.entry(table.to_string()).or_default() += 1;
        }

        self.wait_for_gate(table).await;

        let inner = self.inner.lock().await;
        inner.check_available(self.side)?;
        let memory_table = inner.table(table, self.side)?;

        let rows = memory_table
            .rows
            .iter()
            .filter(|(key, _)| request.after.as_ref().is_none_or(|after| *key > after))
            .filter(|(_, values)| {
                request.modified.as_ref().is_none_or(|filter| {
                    values
                        .get(&filter.column)
                        .and_then(Value::as_timestamp)
                        .is_some_and(|modified_at| modified_at > filter.since)
                })
            })
            .take(request.limit)
            .map(|(key, values)| TableRow::new(key.clone(), values.clone()))
            .collect();

        Ok(rows)
    }

    async fn fetch_rows(&self, table: &str, keys: &[PrimaryKey]) -> SyncResult<Vec<TableRow>> {
        let inner = self.inner.lock().await;
        inner.check_available(self.side)?;
        let memory_table = inner.table(table, self.side)?;

        Ok(keys
            .iter()
            .filter_map(|key| {
                memory_table
                    .rows
                    .get(key)
                    .map(|values| TableRow::new(key.clone(), values.clone()))
            })
            .collect())
    }
}

impl Target for MemoryDatabase {
    async fn apply_batch(&self, table: &str, writes: &[RowWrite]) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available(self.side)?;

        if let Some((remaining, kind)) = inner.failing_writes {
            inner.failing_writes = (remaining > 1).then_some((remaining - 1, kind));
            bail!(
                kind,
                "Injected write failure",
                format!("Batch of {} writes to '{table}' was rejected", writes.len())
            );
        }

        let side = self.side;
        let memory_table = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| missing_table(table, side))?;

        // Writes go to a copy which replaces the table only if every write succeeds.
        let mut staged = memory_table.clone();
        for write in writes {
            staged.apply(write, side)?;
        }
        *memory_table = staged;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    async fn items() -> MemoryDatabase {
        let database = MemoryDatabase::new(Side::Target);
        database
            .create_table(TableSchema::new(
                "items",
                vec![
                    ColumnSchema::key("id", ColumnType::Integer),
                    ColumnSchema::new("v", ColumnType::Text, true),
                ],
            ))
            .await;
        database.add_unique_constraint("items", "v").await.unwrap();

        database
    }

    fn upsert(id: i64, v: &str) -> RowWrite {
        RowWrite::Upsert(TableRow::new(
            PrimaryKey::single(id),
            RowImage::from([("v".to_string(), Value::from(v))]),
        ))
    }

    #[tokio::test]
    async fn batches_are_atomic() {
        let database = items().await;
        database.apply_batch("items", &[upsert(1, "A")]).await.unwrap();

        let err = database
            .apply_batch("items", &[upsert(2, "B"), upsert(3, "A")])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(database.rows("items").await.len(), 1);
    }

    #[tokio::test]
    async fn pages_follow_key_order() {
        let database = items().await;
        database
            .apply_batch("items", &[upsert(3, "C"), upsert(1, "A"), upsert(2, "B")])
            .await
            .unwrap();

        let page = database
            .read_page(
                "items",
                PageRequest {
                    after: Some(PrimaryKey::single(1)),
                    limit: 1,
                    modified: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, PrimaryKey::single(2));
        assert_eq!(database.read_calls("items").await, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let database = items().await;
        database
            .fail_next_writes(1, ErrorKind::TargetConnectionFailed)
            .await;

        let err = database.apply_batch("items", &[upsert(1, "A")]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetConnectionFailed);
        database.apply_batch("items", &[upsert(1, "A")]).await.unwrap();

        database.set_unavailable(true).await;
        assert_eq!(
            database.ping().await.unwrap_err().kind(),
            ErrorKind::TargetConnectionFailed
        );
    }
}
