//! Error types for the persistent store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error for a JSON column.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted row failed to parse back into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The requested command does not exist.
    #[error("no such command: {0}")]
    NotFound(i64),

    /// An illegal status transition was requested.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}
