//! Error types for the data model and its configuration.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or checking core data.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration values out of range
    #[error("Invalid chain config: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signing key material was malformed
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}
