//! Error types for the node.

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An environment variable was set but could not be parsed
    #[error("Invalid {var}={value:?}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// Chain configuration could not be loaded or is inconsistent
    #[error("Chain config error: {0}")]
    ChainConfig(#[from] hexchain_core::Error),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] hexchain_protocols::NetworkError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
