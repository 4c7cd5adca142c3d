//! Postgres helpers shared by the sync engine: connection pools, quoted table names,
//! catalog lookups and the queries backing the persisted sync state in the `sync` schema.

pub mod db;
pub mod schema;
pub mod state;
