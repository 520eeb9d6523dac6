//! Error types for adx-relay.
//!
//! Uses `thiserror` for library-style error definitions.

use thiserror::Error;

/// Errors that can occur in relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Key/value store access failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Object-store listing returned an error status
    #[error("object store error (HTTP {status}): {message}")]
    ObjectStore { status: u16, message: String },

    /// Downstream worker rejected a dispatch batch
    #[error("worker POST failed (HTTP {status})")]
    Worker { status: u16 },

    /// Snapshot file I/O failed
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file is structurally invalid
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}
