//! Error types for the document client crate.

use thiserror::Error;
use tripsync_core::errors::{RemoteError, RemoteErrorKind, RetryClass};

/// Result type alias for document client operations.
pub type Result<T> = std::result::Result<T, DocumentClientError>;

/// Errors that can occur while talking to the document database.
#[derive(Debug, Error)]
pub enum DocumentClientError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error status returned by the document API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (bad path, missing configuration, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Well-formed JSON that does not follow the document wire format
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Authentication error (invalid token)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl DocumentClientError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 => RetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => RetryClass::Retryable,
                500..=599 => RetryClass::Retryable,
                _ => RetryClass::Permanent,
            },
            Self::Http(_) => RetryClass::Retryable,
            Self::Json(_) | Self::InvalidResponse(_) => RetryClass::Permanent,
            Self::InvalidRequest(_) => RetryClass::Permanent,
            Self::Auth(_) => RetryClass::ReauthRequired,
        }
    }

    fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            Self::Api { status, .. } => match *status {
                400 | 412 => RemoteErrorKind::InvalidArgument,
                401 => RemoteErrorKind::Unauthenticated,
                403 => RemoteErrorKind::PermissionDenied,
                404 => RemoteErrorKind::NotFound,
                408 | 409 | 423 | 425 | 429 | 500..=599 => RemoteErrorKind::Unavailable,
                _ => RemoteErrorKind::Internal,
            },
            Self::Http(_) => RemoteErrorKind::Unavailable,
            Self::Json(_) | Self::InvalidResponse(_) => RemoteErrorKind::Internal,
            Self::InvalidRequest(_) => RemoteErrorKind::InvalidArgument,
            Self::Auth(_) => RemoteErrorKind::Unauthenticated,
        }
    }
}

impl From<DocumentClientError> for RemoteError {
    fn from(err: DocumentClientError) -> Self {
        RemoteError::new(err.remote_kind(), err.to_string())
    }
}

impl From<DocumentClientError> for tripsync_core::Error {
    fn from(err: DocumentClientError) -> Self {
        tripsync_core::Error::Remote(err.into())
    }
}
