//! Configuration History Library
//!
//! Watches a configuration tree, keeps timestamped snapshots of every tracked
//! unit and restores them, down to single records of multi-record YAML files.

pub mod cache;
pub mod config;
pub mod engine;
pub mod model;
pub mod pipeline;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Settings;
pub use engine::HistoryEngine;
pub use restore::RestoreRequest;
pub use utils::errors::HistoryError;
pub type Result<T> = std::result::Result<T, HistoryError>;
