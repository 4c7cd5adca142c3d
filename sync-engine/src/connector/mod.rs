//! Access to the tables of the source and the target.

mod base;
pub mod memory;
pub mod postgres;

pub use base::{Connector, ModifiedFilter, PageRequest, RowWrite, Side, Target};
