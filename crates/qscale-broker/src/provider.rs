//! Ties broker configs, credentials and the registry together.
//!
//! Scaling passes call [`BrokerProvider::acquire`] and get whatever client
//! the registry holds, constructing one on first use. Broker config passes
//! call [`BrokerProvider::sync`], which re-resolves credentials, replaces
//! the client when its resolved settings changed, probes connectivity and
//! records the outcome on the config's health.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use qscale_state::{BrokerHealth, BrokerId, EntityStore, SecretId, StateError, epoch_secs};

use crate::client::{Broker, BrokerConnector, ResolvedBroker};
use crate::error::{BrokerError, BrokerResult};
use crate::registry::BrokerRegistry;
use crate::secrets::SecretResolver;

pub const CONNECTED_MESSAGE: &str = "Connected to broker";
pub const DISCONNECTED_MESSAGE: &str = "Failed to connect to broker";

/// Result of reconciling one broker config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Config is gone; its client and dependencies were dropped.
    Removed,
    Healthy,
    Unhealthy(String),
}

pub struct BrokerProvider {
    store: Arc<dyn EntityStore>,
    resolver: Arc<SecretResolver>,
    registry: Arc<BrokerRegistry>,
    connector: Arc<dyn BrokerConnector>,
    /// Fingerprint of the resolved settings each live client was built from.
    fingerprints: Mutex<HashMap<BrokerId, String>>,
}

impl BrokerProvider {
    pub fn new(
        store: Arc<dyn EntityStore>,
        resolver: Arc<SecretResolver>,
        registry: Arc<BrokerRegistry>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            store,
            resolver,
            registry,
            connector,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<SecretResolver> {
        &self.resolver
    }

    /// Client for `id`, connecting on first use.
    pub async fn acquire(&self, id: &BrokerId) -> BrokerResult<Arc<dyn Broker>> {
        self.registry
            .get_or_create(id, || async {
                let config = self
                    .store
                    .get_broker_config(id)
                    .await?
                    .ok_or_else(|| BrokerError::ConfigNotFound(id.to_string()))?;
                let resolved = self.resolver.resolve_config(&config).await?;
                self.connect(&resolved).await
            })
            .await
    }

    async fn connect(&self, resolved: &ResolvedBroker) -> BrokerResult<Arc<dyn Broker>> {
        let broker = self.connector.connect(resolved).await?;
        self.fingerprints
            .lock()
            .await
            .insert(resolved.id.clone(), resolved.fingerprint());
        Ok(broker)
    }

    /// Reconcile one broker config: client freshness and health.
    pub async fn sync(&self, id: &BrokerId) -> BrokerResult<SyncOutcome> {
        let Some(config) = self.store.get_broker_config(id).await? else {
            self.registry.remove(id).await;
            self.resolver.forget(id).await;
            self.fingerprints.lock().await.remove(id);
            info!(broker = %id, "broker config deleted, client dropped");
            return Ok(SyncOutcome::Removed);
        };

        let resolved = match self.resolver.resolve_config(&config).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.registry.remove(id).await;
                self.fingerprints.lock().await.remove(id);
                let message = format!("{DISCONNECTED_MESSAGE}: {e}");
                warn!(broker = %id, error = %e, "credential resolution failed");
                self.write_health(id, false, &message).await?;
                return Ok(SyncOutcome::Unhealthy(message));
            }
        };

        let fingerprint = resolved.fingerprint();
        let live = self.registry.lookup(id).await.ok();
        let current = self.fingerprints.lock().await.get(id).cloned();

        let broker = match live {
            Some(broker) if current.as_deref() == Some(fingerprint.as_str()) => broker,
            _ => {
                debug!(broker = %id, fresh = current.is_none(), "building broker client");
                match self.registry.replace(id, || self.connect(&resolved)).await {
                    Ok(broker) => broker,
                    Err(e) => {
                        self.fingerprints.lock().await.remove(id);
                        let message = format!("{DISCONNECTED_MESSAGE}: {e}");
                        warn!(broker = %id, error = %e, "broker connection failed");
                        self.write_health(id, false, &message).await?;
                        return Ok(SyncOutcome::Unhealthy(message));
                    }
                }
            }
        };

        if broker.is_connected().await {
            self.registry.report_success(id).await;
            self.write_health(id, true, CONNECTED_MESSAGE).await?;
            Ok(SyncOutcome::Healthy)
        } else {
            self.registry.report_failure(id).await;
            self.write_health(id, false, DISCONNECTED_MESSAGE).await?;
            Ok(SyncOutcome::Unhealthy(DISCONNECTED_MESSAGE.to_string()))
        }
    }

    /// Broker configs whose clients depend on `secret`.
    pub async fn secret_changed(&self, secret: &SecretId) -> Vec<BrokerId> {
        self.resolver.dependents(secret).await
    }

    /// Record a failed call made through the client for `id`.
    pub async fn report_failure(&self, id: &BrokerId, error: &BrokerError) {
        if self.registry.report_failure(id).await {
            self.fingerprints.lock().await.remove(id);
        }
        let message = format!("{DISCONNECTED_MESSAGE}: {error}");
        if let Err(e) = self.write_health(id, false, &message).await {
            debug!(broker = %id, error = %e, "could not record broker health");
        }
    }

    pub async fn report_success(&self, id: &BrokerId) {
        self.registry.report_success(id).await;
    }

    async fn write_health(&self, id: &BrokerId, healthy: bool, message: &str) -> BrokerResult<()> {
        let health = BrokerHealth {
            healthy,
            message: message.to_string(),
            checked_at: epoch_secs(),
        };
        match self.store.update_broker_health(id, &health).await {
            // Deleted concurrently; the next pass drops the client.
            Err(StateError::NotFound(_)) => Ok(()),
            other => Ok(other?),
        }
    }
}
