//! Error types for the CloudFort server
//!
//! `LeaseError` is what a command handler fails with. Its `Display` text is
//! exactly what follows `error: ` on the wire.

use thiserror::Error;

use crate::locks::{LockStatus, PersistError};
use crate::world::StoreError;

/// Result type for command handling
pub type Result<T> = std::result::Result<T, LeaseError>;

/// Failure categories reported to peers and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Unauthorized,
    IntegrityFailure,
    IoFailure,
    ProtocolError,
}

/// Command handling error
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("No world named '{0}'")]
    NotFound(String),

    #[error("World '{world}' is unavailable (status == {status})")]
    Unavailable { world: String, status: LockStatus },

    #[error("World '{world}' is unavailable: its lease changed hands during the transfer")]
    LeaseLost { world: String },

    #[error("World '{0}' cannot be checked in because it is not checked out")]
    NotCheckedOut(String),

    #[error("Overseer {overseer} is not the current holder of world {world}")]
    Unauthorized { overseer: String, world: String },

    #[error("File hash mismatch: declared {declared}, actual {actual}")]
    HashMismatch { declared: String, actual: String },

    #[error("Archive too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Archive for world '{world}' not found at {path}")]
    ArchiveMissing { world: String, path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("World store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Persist(#[from] PersistError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl LeaseError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unavailable { .. } | Self::LeaseLost { .. } | Self::NotCheckedOut(_) => {
                ErrorKind::Unavailable
            }
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::HashMismatch { .. } | Self::TooLarge { .. } => ErrorKind::IntegrityFailure,
            Self::Store(StoreError::RootNotFound(_)) => ErrorKind::IntegrityFailure,
            Self::ArchiveMissing { .. }
            | Self::Io(_)
            | Self::Timeout(_)
            | Self::Store(_)
            | Self::Persist(_)
            | Self::Json(_) => ErrorKind::IoFailure,
            Self::Protocol(_) => ErrorKind::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_mentions_unavailable() {
        let err = LeaseError::Unavailable {
            world: "embark1".to_string(),
            status: LockStatus::CheckedOut,
        };
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.to_string().contains("unavailable"));
        assert!(err.to_string().contains("checked-out"));
    }

    #[test]
    fn test_kinds() {
        assert_eq!(LeaseError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            LeaseError::HashMismatch {
                declared: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::IntegrityFailure
        );
        assert_eq!(
            LeaseError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")).kind(),
            ErrorKind::IoFailure
        );
        assert_eq!(
            LeaseError::Store(StoreError::RootNotFound("up.zip".into())).kind(),
            ErrorKind::IntegrityFailure
        );
        assert_eq!(LeaseError::Protocol("?".into()).kind(), ErrorKind::ProtocolError);
    }
}
