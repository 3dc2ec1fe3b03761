//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Failed to read the configuration file.
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    /// Extraction or parse error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] Box<figment::Error>),

    /// A connection carries an endpoint the proxy cannot serve or dial.
    #[error("connection '{connection_id}': {reason}")]
    InvalidConnection {
        connection_id: String,
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-connection error.
    pub fn invalid_connection(connection_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidConnection {
            connection_id: connection_id.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(Box::new(err))
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
