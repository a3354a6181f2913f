//! World store error types

use thiserror::Error;

/// Archive and save-folder errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error (std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unreadable zip archive
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Neither root marker file exists in the archive
    #[error("Neither world.dat nor world.sav could be found in {0}")]
    RootNotFound(String),

    /// Directory walk failed
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// Blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

/// Result type alias for world store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
