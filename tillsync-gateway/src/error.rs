//! Error types for the edge-gateway client.

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur talking to the edge gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No gateway endpoint is configured. Deliberate: an unconfigured
    /// client never probes an implicit default.
    #[error("no edge gateway configured")]
    NotConfigured,

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway answered with a failure status.
    #[error("gateway answered with status {0}")]
    Status(u16),
}
