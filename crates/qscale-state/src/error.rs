//! Error types for the qscale entity and secret stores.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

/// Errors from resolving a credential against the secret store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("key {key} not found in secret {secret}")]
    KeyNotFound { secret: String, key: String },

    #[error("invalid secret reference: {0}")]
    InvalidReference(String),

    #[error("secret {secret} key {key} is not valid UTF-8")]
    InvalidUtf8 { secret: String, key: String },

    #[error("secret store error: {0}")]
    Store(String),
}

impl From<StateError> for SecretError {
    fn from(err: StateError) -> Self {
        SecretError::Store(err.to_string())
    }
}
