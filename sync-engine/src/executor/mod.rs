//! Application of clean changes to the target.

pub mod batch;
pub mod retry;
pub mod write;
