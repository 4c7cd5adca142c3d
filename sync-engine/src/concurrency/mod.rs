//! Coordination primitives shared by the orchestrator and its workers.
//!
//! A job run owns one [`shutdown`] channel. Stopping the job flips it once and every table
//! worker and lane observes it at its next checkpoint: before a detection batch is read and
//! before a write chunk is sent. Work that already started, including its ledger append, runs
//! to completion so a stop never leaves a committed write without its ledger entry.

pub mod shutdown;
