//! Credential resolution and secret dependency tracking.
//!
//! Broker configs reference credentials either as literals or as
//! `(secret, key)` pairs. The resolver reads referenced values out of the
//! [`SecretStore`] and remembers which broker configs depend on which
//! secrets, so a secret change can be fanned out to the configs whose
//! clients must be rebuilt.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use qscale_state::{
    BrokerConfig, BrokerId, BrokerSettings, Credential, SecretError, SecretId, SecretStore,
};

use crate::client::{ResolvedBroker, ResolvedSettings};

pub struct SecretResolver {
    secrets: Arc<dyn SecretStore>,
    /// secret → broker configs referencing it.
    dependents: RwLock<HashMap<SecretId, BTreeSet<BrokerId>>>,
}

impl SecretResolver {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            dependents: RwLock::new(HashMap::new()),
        }
    }

    /// Produce the plaintext for `credential`, looking references up in `namespace`.
    pub async fn resolve(
        &self,
        namespace: &str,
        credential: &Credential,
    ) -> Result<String, SecretError> {
        match credential {
            Credential::Value(value) => Ok(value.clone()),
            Credential::SecretKeyRef(r) => {
                if r.name.is_empty() || r.key.is_empty() {
                    return Err(SecretError::InvalidReference(format!(
                        "secret reference needs both name and key (name={:?}, key={:?})",
                        r.name, r.key
                    )));
                }
                let bytes = self
                    .secrets
                    .get_secret_value(namespace, &r.name, &r.key)
                    .await?;
                String::from_utf8(bytes).map_err(|_| SecretError::InvalidUtf8 {
                    secret: SecretId::new(namespace, r.name.clone()).to_string(),
                    key: r.key.clone(),
                })
            }
        }
    }

    /// Resolve every credential field of `config`.
    ///
    /// Referenced secrets are tracked as dependencies of the config before
    /// resolution, so a secret that does not exist yet still triggers a
    /// rebuild once it is created. Dependencies from earlier revisions of
    /// the config that are no longer referenced are dropped.
    pub async fn resolve_config(
        &self,
        config: &BrokerConfig,
    ) -> Result<ResolvedBroker, SecretError> {
        let namespace = config.key.namespace.as_str();

        self.forget(&config.key).await;
        for credential in config.settings.credentials() {
            if let Credential::SecretKeyRef(r) = credential {
                self.track(&config.key, SecretId::new(namespace, r.name.clone()))
                    .await;
            }
        }

        let settings = match &config.settings {
            BrokerSettings::Redis(redis) => {
                let password = match &redis.password {
                    Some(credential) => Some(self.resolve(namespace, credential).await?),
                    None => None,
                };
                ResolvedSettings::Redis {
                    host: redis.host.clone(),
                    port: redis.port,
                    db: redis.db,
                    password,
                }
            }
        };

        Ok(ResolvedBroker {
            id: config.key.clone(),
            settings,
        })
    }

    /// Record that `broker` depends on `secret`. Idempotent.
    pub async fn track(&self, broker: &BrokerId, secret: SecretId) {
        let mut deps = self.dependents.write().await;
        if deps.entry(secret.clone()).or_default().insert(broker.clone()) {
            debug!(%broker, %secret, "tracking secret dependency");
        }
    }

    /// Broker configs that reference `secret`.
    pub async fn dependents(&self, secret: &SecretId) -> Vec<BrokerId> {
        self.dependents
            .read()
            .await
            .get(secret)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every dependency recorded for `broker`.
    pub async fn forget(&self, broker: &BrokerId) {
        let mut deps = self.dependents.write().await;
        deps.retain(|_, brokers| {
            brokers.remove(broker);
            !brokers.is_empty()
        });
    }
}
