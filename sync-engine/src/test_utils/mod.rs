//! Helpers for tests of the engine and of crates embedding it.
//!
//! [`fixtures`] builds in-memory source and target databases with an engine on top,
//! [`notifying_store::NotifyingStore`] lets a test wait until a table or job reaches a status
//! instead of polling, and [`failpoints::CustomFailScenario`] scopes fail point configuration
//! to a single test.

pub mod failpoints;
pub mod fixtures;
pub mod notify;
pub mod notifying_store;
