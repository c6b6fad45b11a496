//! Error types for the storage engine adapter.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the storage engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The statement was rejected or failed inside SQLite.
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure around the database files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine was closed.
    #[error("database is closed")]
    Closed,

    /// An import directory did not contain an export.
    #[error("no database export found at {}", .0.display())]
    MissingExport(PathBuf),

    /// A blocking engine task panicked or was cancelled.
    #[error("engine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
