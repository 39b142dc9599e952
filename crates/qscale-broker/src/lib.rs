//! qscale-broker — message broker access for the qscale control loop.
//!
//! # Architecture
//!
//! ```text
//! BrokerConfig ──► SecretResolver ──► ResolvedBroker ──► BrokerConnector
//!                     │  (tracks secret → config)              │
//!                     ▼                                        ▼
//!              secret change fan-out              BrokerRegistry (one client
//!                                                 per identity, per-identity lock)
//!                                                              │
//!                     BrokerProvider::acquire / sync ◄─────────┘
//! ```
//!
//! [`Broker`] is the capability set every broker kind offers: queue depth,
//! graceful-shutdown signaling and a liveness probe. [`RedisBroker`] is the
//! only kind shipped.

pub mod client;
pub mod error;
pub mod provider;
pub mod redis_broker;
pub mod registry;
pub mod secrets;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{
    Broker, BrokerConnector, DEATH_MARKER, ResolvedBroker, ResolvedSettings, death_queue,
};
pub use error::{BrokerError, BrokerResult};
pub use provider::{BrokerProvider, CONNECTED_MESSAGE, DISCONNECTED_MESSAGE, SyncOutcome};
pub use redis_broker::{RedisBroker, RedisConnector};
pub use registry::{BrokerRegistry, DEFAULT_FAILURE_THRESHOLD};
pub use secrets::SecretResolver;
