//! Batch synchronization engine.
//!
//! Reconciles tables of a system-of-record (the source) with a target store. For every
//! table of a [`SyncJob`](state::job::SyncJob) the engine pages through both sides,
//! fingerprints row contents, classifies the differences against the baseline agreed at
//! the last reconciliation, applies clean changes in atomic batches and records every
//! write in an append-only ledger that supports time-bounded rollback. Diverging rows
//! become conflicts that are resolved automatically or by an operator.
//!
//! The control surface is [`SyncEngine`](engine::SyncEngine).

pub mod concurrency;
pub mod conflict;
pub mod connector;
pub mod context;
pub mod detection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod failpoints;
pub mod ledger;
mod macros;
pub mod migrations;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
