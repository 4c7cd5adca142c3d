//! Persistence of jobs, conflicts, records and the change ledger.

pub mod both;
pub mod job;
pub mod ledger;
