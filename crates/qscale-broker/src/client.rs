//! Broker client abstraction.
//!
//! A [`Broker`] answers three questions for the control loop: how deep is a
//! queue, tell one worker on it to drain and exit, and is the broker
//! reachable at all. Clients are built by a [`BrokerConnector`] from a
//! [`ResolvedBroker`], i.e. a broker config whose credentials have already
//! been read out of the secret store.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use qscale_state::BrokerId;

use crate::error::BrokerResult;

/// Payload pushed onto a death queue; a worker popping it exits gracefully.
pub const DEATH_MARKER: &str = r#"{"kill":"true"}"#;

/// Name of the shutdown-signal queue paired with `topic`.
pub fn death_queue(topic: &str) -> String {
    format!("death-{topic}")
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Current number of items waiting on `topic`.
    async fn queue_length(&self, topic: &str) -> BrokerResult<u64>;

    /// Ask exactly one worker consuming `topic` to drain and exit.
    async fn signal_graceful_shutdown(&self, topic: &str) -> BrokerResult<()>;

    /// Cheap round trip; false when the broker did not answer as expected.
    async fn is_connected(&self) -> bool;
}

/// Builds broker clients from resolved settings.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, broker: &ResolvedBroker) -> BrokerResult<Arc<dyn Broker>>;
}

/// Broker settings with credentials substituted in.
#[derive(Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedSettings {
    Redis {
        host: String,
        port: u16,
        db: i64,
        password: Option<String>,
    },
}

impl fmt::Debug for ResolvedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSettings::Redis {
                host,
                port,
                db,
                password,
            } => f
                .debug_struct("Redis")
                .field("host", host)
                .field("port", port)
                .field("db", db)
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBroker {
    pub id: BrokerId,
    pub settings: ResolvedSettings,
}

impl ResolvedBroker {
    /// Hex SHA-256 over the resolved settings.
    ///
    /// Changes whenever an address or a credential value changes, so a live
    /// client built from an older fingerprint must be replaced.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.settings).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}
