//! Error types for Convoy

use thiserror::Error;

/// Result type alias for Convoy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Convoy operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Git operation error
    #[error("Git error: {0}")]
    Git(String),

    /// Agent execution error
    #[error("Agent error: {0}")]
    Agent(String),

    /// Cross-process file lock could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// Feature id not present in the feature file
    #[error("Feature not found: {0}")]
    FeatureNotFound(u64),

    /// Session persistence error
    #[error("Session log error: {0}")]
    Db(#[from] convoy_db::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
