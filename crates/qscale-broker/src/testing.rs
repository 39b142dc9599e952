//! In-memory broker and connector.
//!
//! `MemoryBroker` keeps queue depths and death-queue pushes in process so
//! the control loop can be driven without a Redis server. Enabled for this
//! crate's tests and, through the `test-util` feature, for dependents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use qscale_state::BrokerId;

use crate::client::{Broker, BrokerConnector, ResolvedBroker, ResolvedSettings, death_queue};
use crate::error::{BrokerError, BrokerResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryBroker {
    depths: Mutex<HashMap<String, u64>>,
    /// Death-queue name → number of signals pushed.
    signals: Mutex<HashMap<String, usize>>,
    disconnected: AtomicBool,
    fail_queries: AtomicBool,
    /// Signals accepted before every further signal fails.
    signal_budget: Mutex<Option<usize>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_length(&self, topic: &str, depth: u64) {
        lock(&self.depths).insert(topic.to_string(), depth);
    }

    /// Shutdown signals received for consumers of `topic`.
    pub fn signals(&self, topic: &str) -> usize {
        lock(&self.signals)
            .get(&death_queue(topic))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Make `queue_length` fail with a connection error.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Accept `n` more signals, then fail the rest.
    pub fn limit_signals(&self, n: Option<usize>) {
        *lock(&self.signal_budget) = n;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn queue_length(&self, topic: &str) -> BrokerResult<u64> {
        if self.fail_queries.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("memory broker unreachable".to_string()));
        }
        Ok(lock(&self.depths).get(topic).copied().unwrap_or(0))
    }

    async fn signal_graceful_shutdown(&self, topic: &str) -> BrokerResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("memory broker unreachable".to_string()));
        }
        {
            let mut budget = lock(&self.signal_budget);
            match budget.as_mut() {
                Some(0) => {
                    return Err(BrokerError::Connection("signal rejected".to_string()));
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }
        *lock(&self.signals).entry(death_queue(topic)).or_default() += 1;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

/// Connector handing out one shared [`MemoryBroker`] per identity.
#[derive(Default)]
pub struct MemoryConnector {
    brokers: Mutex<HashMap<BrokerId, Arc<MemoryBroker>>>,
    passwords: Mutex<HashMap<BrokerId, Option<String>>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker backing `id`, created on first access.
    pub fn broker(&self, id: &BrokerId) -> Arc<MemoryBroker> {
        lock(&self.brokers).entry(id.clone()).or_default().clone()
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Password used by the most recent connection for `id`.
    pub fn password(&self, id: &BrokerId) -> Option<String> {
        lock(&self.passwords).get(id).cloned().flatten()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, broker: &ResolvedBroker) -> BrokerResult<Arc<dyn Broker>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        let ResolvedSettings::Redis { password, .. } = &broker.settings;
        lock(&self.passwords).insert(broker.id.clone(), password.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);
        // Fresh handle so callers can tell a reconnect from a cached client.
        Ok(Arc::new(SharedBroker(self.broker(&broker.id))))
    }
}

/// Distinct client handle over a shared in-memory broker.
struct SharedBroker(Arc<MemoryBroker>);

#[async_trait]
impl Broker for SharedBroker {
    async fn queue_length(&self, topic: &str) -> BrokerResult<u64> {
        self.0.queue_length(topic).await
    }

    async fn signal_graceful_shutdown(&self, topic: &str) -> BrokerResult<()> {
        self.0.signal_graceful_shutdown(topic).await
    }

    async fn is_connected(&self) -> bool {
        self.0.is_connected().await
    }
}
