//! Error types for the goproxy.cn mirror

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Backend status codes that indicate a transient failure worth retrying.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors that can occur in the mirror
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// The requested artifact does not exist in durable storage
    #[error("cache not found")]
    CacheNotFound,

    /// The origin could not resolve the requested module
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// Operation on a reader that was already closed
    #[error("cache reader is closed")]
    Closed,

    /// Seek target before the start of the object
    #[error("invalid seek to offset {offset}")]
    InvalidSeek { offset: i128 },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Durable storage or upstream answered with a non-success status
    #[error("backend {operation} returned {status}: {message}")]
    Backend {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// Transport-level failure talking to a backend
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Backend call did not finish in time
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Request signing failed
    #[error("signing error: {0}")]
    Signing(String),

    /// Operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or traversal request path
    #[error("invalid request path: {0}")]
    InvalidPath(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a backend error for the given operation and status.
    pub fn backend(operation: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            status,
            message: message.into(),
        }
    }

    /// Reports whether the error is a durable-storage miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CacheNotFound)
    }

    /// Reports whether the error belongs to a transient failure class.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// HTTP status the front door answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CacheNotFound | Self::ModuleNotFound(_) | Self::InvalidPath(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_retryable() => StatusCode::BAD_GATEWAY,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
