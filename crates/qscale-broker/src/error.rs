//! Error types for broker clients and the broker registry.

use qscale_state::{SecretError, StateError};
use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or the call timed out.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker answered with something we cannot interpret.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("no broker registered for {0}")]
    NotFound(String),

    #[error("broker config not found: {0}")]
    ConfigNotFound(String),

    #[error("unsupported broker kind: {0}")]
    UnsupportedKind(String),

    #[error("credential resolution failed: {0}")]
    Secret(#[from] SecretError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl BrokerError {
    /// Whether the failure says something about broker connectivity.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Protocol(_))
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.kind() == redis::ErrorKind::AuthenticationFailed
        {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Protocol(err.to_string())
        }
    }
}
