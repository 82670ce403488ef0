//! Error types for the cloud client and replay engine.

use thiserror::Error;

/// Result type for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur replaying a command against the cloud API.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Transport-level failure (connect, TLS, decode).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server rejected the request (4xx). Terminal: retrying an
    /// invalid request cannot succeed.
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The server failed (5xx). Retryable.
    #[error("server error: status {status}")]
    Server { status: u16 },

    /// The request timed out. Retryable.
    #[error("request timed out")]
    Timeout,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CloudError {
    /// Whether a retry can plausibly succeed. Validation failures
    /// (`Rejected`) are terminal and must not consume retry budget;
    /// everything network-shaped is worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Rejected { .. } | CloudError::Config(_) | CloudError::Serialization(_) => {
                false
            }
            CloudError::Server { .. } | CloudError::Timeout => true,
            CloudError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
        }
    }
}
