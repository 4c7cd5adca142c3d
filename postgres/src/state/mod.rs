//! Queries for the persisted sync state.
//!
//! Every table lives in the `sync` schema created by the engine migrations. Row images,
//! primary keys and job configurations are stored as `jsonb` and converted by the caller.

pub mod conflicts;
pub mod events;
pub mod jobs;
pub mod ledger;
