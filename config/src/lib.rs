//! Configuration types and loading for the synchronization engine and its binaries.

pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config, load_config_from};
