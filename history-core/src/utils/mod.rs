//! Utility modules for the history engine.

pub mod errors;
pub mod logger;

pub use errors::{HistoryError, Result};
