//! Configuration for the block data storage engine.
//!
//! Settings persist to disk as a RON file, tolerate missing and unknown
//! fields, and can be hot-reloaded.

mod config;
mod error;

pub use config::{CONFIG_FILE_NAME, Config, DebugConfig, DeflateConfig, StorageConfig};
pub use error::ConfigError;
