//! Error types shared across the proxy.

use thiserror::Error;

/// Errors raised by the socket layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing a target endpoint failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The peer closed the connection.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Writing a frame failed.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// The endpoint string could not be turned into a request.
    #[error("invalid endpoint: {url} - {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

impl TransportError {
    /// Creates a connection failure for the given URL.
    pub fn connection_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an invalid-endpoint error for the given URL.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A frame was not valid JSON or did not match the expected shape.
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No route is registered for the requested path.
    #[error("no route for path {path} on port {port}")]
    UnknownRoute { port: u16, path: String },

    /// A live client is already attached to the connection.
    #[error("connection '{0}' already has a live client")]
    DuplicateClient(String),

    /// The route resolved but no configuration exists for it.
    #[error("connection '{0}' has no configuration")]
    MissingConfig(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
