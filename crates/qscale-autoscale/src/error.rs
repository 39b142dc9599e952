//! Errors surfaced by a reconciliation pass.

use qscale_broker::BrokerError;
use qscale_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Instance creation failed part way; earlier creations stay committed.
    #[error("created {created} of {requested} instances: {source}")]
    CreationFailed {
        created: u32,
        requested: u32,
        #[source]
        source: StateError,
    },

    /// Signaling failed part way; signals already sent are not retracted.
    #[error("sent {sent} of {requested} shutdown signals: {source}")]
    SignalFailed {
        sent: u32,
        requested: u32,
        #[source]
        source: BrokerError,
    },

    #[error("status update for {key} conflicted {attempts} times")]
    ConflictRetriesExhausted { key: String, attempts: u32 },

    #[error("pass cancelled")]
    Cancelled,

    #[error("pass deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),
}

impl ReconcileError {
    /// Whether the controller should schedule another pass.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::Cancelled)
    }
}
