//! StateStore — redb-backed entity and secret persistence for qscale.
//!
//! Provides typed CRUD operations over workloads, instances, broker configs
//! and secrets. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing). Mutations that other components react to are
//! published on a broadcast change feed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::{EntityStore, SecretStore};
use crate::error::{SecretError, StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const EVENT_CAPACITY: usize = 1024;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(BROKER_CONFIGS).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to the change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // ── Table helpers ──────────────────────────────────────────────

    fn read<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    /// Read-modify-write a single record inside one write transaction.
    ///
    /// `f` receives the current value and returns the value to store (`None`
    /// leaves the record untouched) plus a result. An error from `f` aborts
    /// the transaction.
    fn update<T, R, F>(&self, def: JsonTable, key: &str, f: F) -> StateResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StateResult<(Option<T>, R)>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let (next, result) = f(current)?;
            if let Some(next) = next {
                let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            result
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Create a workload or replace its spec, preserving status.
    pub fn put_workload(&self, key: &WorkloadId, spec: WorkloadSpec) -> StateResult<Workload> {
        let now = epoch_secs();
        let stored = self.update(WORKLOADS, &key.table_key(), |current: Option<Workload>| {
            let next = match current {
                Some(mut existing) => {
                    existing.spec = spec;
                    existing.version += 1;
                    existing.updated_at = now;
                    existing
                }
                None => Workload {
                    key: key.clone(),
                    spec,
                    status: WorkloadStatus::default(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                },
            };
            Ok((Some(next.clone()), next))
        })?;
        debug!(workload = %key, version = stored.version, "workload stored");
        self.publish(StoreEvent::WorkloadChanged(key.clone()));
        Ok(stored)
    }

    pub fn get_workload(&self, key: &WorkloadId) -> StateResult<Option<Workload>> {
        self.read(WORKLOADS, &key.table_key())
    }

    pub fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        self.scan(WORKLOADS, "")
    }

    /// Persist status if the stored version matches. Returns the new version.
    pub fn update_workload_status(
        &self,
        key: &WorkloadId,
        status: &WorkloadStatus,
        expected_version: u64,
    ) -> StateResult<u64> {
        let table_key = key.table_key();
        self.update(WORKLOADS, &table_key, |current: Option<Workload>| {
            let mut workload = current.ok_or_else(|| StateError::NotFound(table_key.clone()))?;
            if workload.version != expected_version {
                return Err(StateError::Conflict {
                    key: table_key.clone(),
                    expected: expected_version,
                    actual: workload.version,
                });
            }
            workload.status = status.clone();
            workload.version += 1;
            workload.updated_at = epoch_secs();
            let version = workload.version;
            Ok((Some(workload), version))
        })
    }

    /// Delete a workload and all its instances. Returns true if it existed.
    pub fn delete_workload(&self, key: &WorkloadId) -> StateResult<bool> {
        let table_key = key.table_key();
        let prefix = format!("{table_key}:");
        let instance_keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut workloads = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            existed = workloads
                .remove(table_key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for k in &instance_keys {
                instances.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workload = %key, existed, instances = instance_keys.len(), "workload deleted");
        if existed {
            self.publish(StoreEvent::WorkloadDeleted(key.clone()));
        }
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance. Fails if the name is taken.
    pub fn create_instance(&self, instance: &Instance) -> StateResult<()> {
        let key = instance.table_key();
        self.update(INSTANCES, &key, |current: Option<Instance>| {
            if current.is_some() {
                return Err(StateError::AlreadyExists(key.clone()));
            }
            Ok((Some(instance.clone()), ()))
        })?;
        debug!(%key, "instance created");
        Ok(())
    }

    pub fn get_instance(&self, workload: &WorkloadId, name: &str) -> StateResult<Option<Instance>> {
        self.read(INSTANCES, &instance_key(workload, name))
    }

    /// List all instances (live or not) owned by a workload.
    pub fn list_instances(&self, workload: &WorkloadId) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, &format!("{}:", workload.table_key()))
    }

    fn modify_instance(
        &self,
        workload: &WorkloadId,
        name: &str,
        f: impl FnOnce(&mut Instance),
    ) -> StateResult<Instance> {
        let key = instance_key(workload, name);
        self.update(INSTANCES, &key, |current: Option<Instance>| {
            let mut instance = current.ok_or_else(|| StateError::NotFound(key.clone()))?;
            f(&mut instance);
            instance.updated_at = epoch_secs();
            Ok((Some(instance.clone()), instance))
        })
    }

    /// Record a lifecycle transition reported by the runtime.
    pub fn set_instance_status(
        &self,
        workload: &WorkloadId,
        name: &str,
        status: InstanceStatus,
    ) -> StateResult<Instance> {
        let instance = self.modify_instance(workload, name, |i| i.status = status)?;
        debug!(%workload, instance = name, ?status, "instance status updated");
        self.publish(StoreEvent::InstanceChanged(workload.clone()));
        Ok(instance)
    }

    /// Record the latest per-slot usage sample for an instance.
    pub fn record_usage(
        &self,
        workload: &WorkloadId,
        name: &str,
        usage: Vec<Resources>,
    ) -> StateResult<()> {
        self.modify_instance(workload, name, |i| i.usage = usage)?;
        Ok(())
    }

    /// Mark an instance as killed for exceeding its memory limit.
    pub fn record_oom_kill(
        &self,
        workload: &WorkloadId,
        name: &str,
        container: Option<usize>,
    ) -> StateResult<()> {
        self.modify_instance(workload, name, |i| i.status = InstanceStatus::OomKilled)?;
        debug!(%workload, instance = name, ?container, "instance OOM killed");
        self.publish(StoreEvent::InstanceOomKilled(OomKill {
            workload: workload.clone(),
            instance: name.to_string(),
            container,
        }));
        Ok(())
    }

    pub fn delete_instance(&self, workload: &WorkloadId, name: &str) -> StateResult<bool> {
        let existed = self.remove(INSTANCES, &instance_key(workload, name))?;
        if existed {
            self.publish(StoreEvent::InstanceChanged(workload.clone()));
        }
        Ok(existed)
    }

    // ── Broker configs ─────────────────────────────────────────────

    /// Create a broker config or replace its settings, preserving health.
    pub fn put_broker_config(
        &self,
        key: &BrokerId,
        settings: BrokerSettings,
    ) -> StateResult<BrokerConfig> {
        let now = epoch_secs();
        let stored = self.update(BROKER_CONFIGS, &key.table_key(), |current: Option<BrokerConfig>| {
            let next = match current {
                Some(mut existing) => {
                    existing.settings = settings;
                    existing.version += 1;
                    existing.updated_at = now;
                    existing
                }
                None => BrokerConfig {
                    key: key.clone(),
                    settings,
                    health: BrokerHealth::default(),
                    version: 1,
                    updated_at: now,
                },
            };
            Ok((Some(next.clone()), next))
        })?;
        debug!(broker = %key, kind = stored.settings.kind(), "broker config stored");
        self.publish(StoreEvent::BrokerConfigChanged(key.clone()));
        Ok(stored)
    }

    pub fn get_broker_config(&self, key: &BrokerId) -> StateResult<Option<BrokerConfig>> {
        self.read(BROKER_CONFIGS, &key.table_key())
    }

    pub fn list_broker_configs(&self) -> StateResult<Vec<BrokerConfig>> {
        self.scan(BROKER_CONFIGS, "")
    }

    pub fn update_broker_health(&self, key: &BrokerId, health: &BrokerHealth) -> StateResult<()> {
        let table_key = key.table_key();
        self.update(BROKER_CONFIGS, &table_key, |current: Option<BrokerConfig>| {
            let mut config = current.ok_or_else(|| StateError::NotFound(table_key.clone()))?;
            config.health = health.clone();
            Ok((Some(config), ()))
        })
    }

    pub fn delete_broker_config(&self, key: &BrokerId) -> StateResult<bool> {
        let existed = self.remove(BROKER_CONFIGS, &key.table_key())?;
        if existed {
            self.publish(StoreEvent::BrokerConfigDeleted(key.clone()));
        }
        Ok(existed)
    }

    // ── Secrets ────────────────────────────────────────────────────

    pub fn put_secret(&self, key: &SecretId, data: BTreeMap<String, String>) -> StateResult<()> {
        let secret = Secret {
            key: key.clone(),
            data,
            updated_at: epoch_secs(),
        };
        self.update(SECRETS, &key.table_key(), |_: Option<Secret>| {
            Ok((Some(secret), ()))
        })?;
        debug!(secret = %key, "secret stored");
        self.publish(StoreEvent::SecretChanged(key.clone()));
        Ok(())
    }

    pub fn get_secret(&self, key: &SecretId) -> StateResult<Option<Secret>> {
        self.read(SECRETS, &key.table_key())
    }

    pub fn delete_secret(&self, key: &SecretId) -> StateResult<bool> {
        let existed = self.remove(SECRETS, &key.table_key())?;
        if existed {
            self.publish(StoreEvent::SecretChanged(key.clone()));
        }
        Ok(existed)
    }
}

#[async_trait]
impl EntityStore for StateStore {
    async fn get_workload(&self, key: &WorkloadId) -> StateResult<Option<Workload>> {
        StateStore::get_workload(self, key)
    }

    async fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        StateStore::list_workloads(self)
    }

    async fn update_workload_status(
        &self,
        key: &WorkloadId,
        status: &WorkloadStatus,
        expected_version: u64,
    ) -> StateResult<u64> {
        StateStore::update_workload_status(self, key, status, expected_version)
    }

    async fn create_instance(&self, instance: &Instance) -> StateResult<()> {
        StateStore::create_instance(self, instance)
    }

    async fn list_instances(&self, workload: &WorkloadId) -> StateResult<Vec<Instance>> {
        StateStore::list_instances(self, workload)
    }

    async fn get_broker_config(&self, key: &BrokerId) -> StateResult<Option<BrokerConfig>> {
        StateStore::get_broker_config(self, key)
    }

    async fn list_broker_configs(&self) -> StateResult<Vec<BrokerConfig>> {
        StateStore::list_broker_configs(self)
    }

    async fn update_broker_health(
        &self,
        key: &BrokerId,
        health: &BrokerHealth,
    ) -> StateResult<()> {
        StateStore::update_broker_health(self, key, health)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        StateStore::subscribe(self)
    }
}

#[async_trait]
impl SecretStore for StateStore {
    async fn get_secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, SecretError> {
        let id = ObjectKey::new(namespace, name);
        let secret = self
            .get_secret(&id)?
            .ok_or_else(|| SecretError::SecretNotFound(id.to_string()))?;
        secret
            .data
            .get(key)
            .map(|v| v.as_bytes().to_vec())
            .ok_or_else(|| SecretError::KeyNotFound {
                secret: id.to_string(),
                key: key.to_string(),
            })
    }
}
