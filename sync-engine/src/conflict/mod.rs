//! Classification of detected changes and settlement of conflicts.

pub mod classifier;
pub mod resolver;
