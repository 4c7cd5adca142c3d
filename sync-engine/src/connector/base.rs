use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncResult};
use crate::schema::TableSchema;
use crate::types::{PrimaryKey, TableRow};

/// Which end of a sync a connector serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Target,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Target => "target",
        }
    }

    /// Kind used when this side cannot be reached.
    pub fn connection_error(&self) -> ErrorKind {
        match self {
            Side::Source => ErrorKind::SourceConnectionFailed,
            Side::Target => ErrorKind::TargetConnectionFailed,
        }
    }

    /// Kind used when a statement against this side fails.
    pub fn query_error(&self) -> ErrorKind {
        match self {
            Side::Source => ErrorKind::SourceQueryFailed,
            Side::Target => ErrorKind::TargetQueryFailed,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restricts a page to rows modified after a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedFilter {
    pub column: String,
    pub since: DateTime<Utc>,
}

/// Keyset pagination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Only rows with a key greater than this one are returned.
    pub after: Option<PrimaryKey>,
    pub limit: usize,
    pub modified: Option<ModifiedFilter>,
}

/// A single write in a target batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    /// Inserts the row or overwrites the given columns of an existing one.
    Upsert(TableRow),
    Delete(PrimaryKey),
}

impl RowWrite {
    pub fn key(&self) -> &PrimaryKey {
        match self {
            RowWrite::Upsert(row) => &row.key,
            RowWrite::Delete(key) => key,
        }
    }
}

/// Read access to the tables of a database.
///
/// Implementations report connectivity problems with the connection kind of their [`Side`] so
/// callers can retry them, and a missing table with [`ErrorKind::MissingTable`].
pub trait Connector {
    fn side(&self) -> Side;

    /// Checks that the database can be reached.
    fn ping(&self) -> impl Future<Output = SyncResult<()>> + Send;

    fn table_schema(&self, table: &str) -> impl Future<Output = SyncResult<TableSchema>> + Send;

    /// Returns up to `limit` rows in ascending key order.
    fn read_page(
        &self,
        table: &str,
        request: PageRequest,
    ) -> impl Future<Output = SyncResult<Vec<TableRow>>> + Send;

    /// Returns the rows with the given keys that exist, in no particular order.
    fn fetch_rows(
        &self,
        table: &str,
        keys: &[PrimaryKey],
    ) -> impl Future<Output = SyncResult<Vec<TableRow>>> + Send;
}

/// A database the engine writes to.
pub trait Target: Connector {
    /// Applies the writes in order as one atomic batch.
    ///
    /// Either every write is applied or none is. A rejected write fails the batch with
    /// [`ErrorKind::ConstraintViolation`].
    fn apply_batch(
        &self,
        table: &str,
        writes: &[RowWrite],
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
