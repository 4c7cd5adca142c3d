pub mod audit;
pub mod conflict;
pub mod job;
pub mod ledger;
pub mod table;
