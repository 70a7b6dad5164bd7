//! Error types shared by every tripsync crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors raised by the local persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(String),
}

/// Coarse classification of a remote document-store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Unavailable,
    PermissionDenied,
    Unauthenticated,
    NotFound,
    InvalidArgument,
    Internal,
}

/// Failure reported by the remote document store.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self.kind {
            RemoteErrorKind::Unavailable | RemoteErrorKind::Internal => RetryClass::Retryable,
            RemoteErrorKind::Unauthenticated => RetryClass::ReauthRequired,
            RemoteErrorKind::PermissionDenied
            | RemoteErrorKind::NotFound
            | RemoteErrorKind::InvalidArgument => RetryClass::Permanent,
        }
    }
}

/// Top-level error for sync operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Retry class if this error came from the remote store.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Remote(err) => err.retry_class(),
            Self::NotAuthenticated => RetryClass::ReauthRequired,
            Self::Database(_) | Self::Unexpected(_) => RetryClass::Retryable,
            _ => RetryClass::Permanent,
        }
    }
}
