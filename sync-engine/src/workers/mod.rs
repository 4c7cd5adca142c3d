//! Table workers and the pool that runs them.

pub mod pool;
pub mod table_sync;
