//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An endpoint with no registered quota policy
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Errors returned by the counter database
    #[error("Storage error: {0}")]
    Storage(#[from] tokio_postgres::Error),

    /// Connection pool errors
    #[error("Pool error: {0}")]
    Pool(String),

    /// A storage call exceeded its deadline
    #[error("Storage call timed out after {0} ms")]
    Timeout(u64),
}

impl From<config::ConfigError> for TollgateError {
    fn from(e: config::ConfigError) -> Self {
        TollgateError::Config(e.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
