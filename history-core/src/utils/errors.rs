//! Error types for the configuration history engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Invalid path component: {0}")]
    InvalidComponent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Snapshot already exists: {0}")]
    Collision(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Backup queue is closed")]
    QueueClosed,

    #[error("Watcher is closed")]
    WatcherClosed,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl HistoryError {
    /// True when the error means the requested thing does not exist on disk.
    pub fn is_not_found(&self) -> bool {
        match self {
            HistoryError::NotFound(_) => true,
            HistoryError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;
