//! Error types for the persistence layer

use thiserror::Error;

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for persistence operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying database error
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Session id not present in the log
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}
