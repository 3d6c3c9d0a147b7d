//! Common error types for GraphDrive.

use thiserror::Error;

/// Top-level error type for GraphDrive operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Authorization failed: bad or expired code, rejected refresh token,
    /// or a request still unauthorized after a forced refresh.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The API rejected the request with a client error (4xx other than 401).
    #[error("Request failed with status {status}: {message}")]
    Request {
        /// HTTP status code.
        status: u16,
        /// Error message or response body returned by the API.
        message: String,
    },

    /// Network failure or server error (5xx). Safe to retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// A chunked upload was aborted.
    #[error("Upload failed at byte offset {offset}: {message}")]
    Upload {
        /// Number of bytes acknowledged by the upload session before the failure.
        offset: u64,
        /// Description of the failure.
        message: String,
    },

    /// A segmented download was aborted.
    #[error("Download failed in segment {segment} (byte offset {offset}): {message}")]
    Download {
        /// Index of the segment that exhausted its retries.
        segment: usize,
        /// Start offset of that segment in the destination file.
        offset: u64,
        /// Description of the failure.
        message: String,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is incomplete.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a chunk or segment that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
