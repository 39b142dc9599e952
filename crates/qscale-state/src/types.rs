//! Domain types for the qscale entity store.
//!
//! Workloads, broker configs, secrets and instances, plus the change events
//! the store publishes. All types are serializable to/from JSON for storage
//! in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace-scoped identity shared by workloads, broker configs and secrets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Composite table key, `{namespace}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a scaled workload.
pub type WorkloadId = ObjectKey;

/// Identity of a broker configuration.
pub type BrokerId = ObjectKey;

/// Identity of a secret.
pub type SecretId = ObjectKey;

// ── Resources ─────────────────────────────────────────────────────

/// CPU and memory quantities for one container slot.
///
/// Used both for requested resources and for observed usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores.
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }
}

// ── Workload ──────────────────────────────────────────────────────

/// Desired-state declaration for a queue-driven workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    /// Queue (topic) whose depth drives scaling.
    pub queue: String,
    /// Name of the broker config, in the workload's namespace.
    pub broker_config_ref: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Replicas per queued item.
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: u32,
    /// Learn per-slot high-water-marks and size new instances from them.
    #[serde(default)]
    pub right_sizing: bool,
    pub template: InstanceTemplate,
}

fn default_scaling_factor() -> u32 {
    1
}

impl WorkloadSpec {
    /// Reject specs that can never converge.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_replicas > self.max_replicas {
            return Err(format!(
                "min_replicas ({}) exceeds max_replicas ({})",
                self.min_replicas, self.max_replicas
            ));
        }
        if self.queue.is_empty() {
            return Err("queue must not be empty".to_string());
        }
        if self.broker_config_ref.is_empty() {
            return Err("broker_config_ref must not be empty".to_string());
        }
        if self.template.containers.is_empty() {
            return Err("template declares no containers".to_string());
        }
        Ok(())
    }

    /// Broker config identity this workload scales against.
    pub fn broker_key(&self, namespace: &str) -> BrokerId {
        ObjectKey::new(namespace, self.broker_config_ref.clone())
    }
}

/// Template from which worker instances are created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceTemplate {
    /// Ordered containers; the index of each is its container slot.
    pub containers: Vec<ContainerTemplate>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerTemplate {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Requested resources when no learned value is available.
    #[serde(default)]
    pub resources: Resources,
}

/// Reconciliation phase of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Active,
    /// The spec can never converge; see `WorkloadStatus::message`.
    Invalid,
}

/// Observed state of a workload. Written only by the control loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkloadStatus {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    /// Hex SHA-256 of the JSON-serialized template.
    #[serde(default)]
    pub template_hash: String,
    /// Per-slot high-water-marks, index-aligned with the template.
    #[serde(default)]
    pub max_container_resource_usage: Vec<Resources>,
    /// Unix seconds of the last successful queue-depth sample.
    #[serde(default)]
    pub last_sampled_at: Option<u64>,
    #[serde(default)]
    pub phase: WorkloadPhase,
    #[serde(default)]
    pub message: Option<String>,
}

/// Persisted workload: spec, status and concurrency token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    pub key: WorkloadId,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
    /// Bumped on every write; status updates must present the current value.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Broker config ─────────────────────────────────────────────────

/// Either a literal value or a reference into a secret.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    Value(String),
    SecretKeyRef(SecretKeyRef),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Value(_) => f.write_str("Value(<redacted>)"),
            Credential::SecretKeyRef(r) => f.debug_tuple("SecretKeyRef").field(r).finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Connection settings for a Redis broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisSettings {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<Credential>,
}

fn default_redis_port() -> u16 {
    6379
}

/// Kind-specific broker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerSettings {
    Redis(RedisSettings),
}

impl BrokerSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerSettings::Redis(_) => "redis",
        }
    }

    /// Credential fields declared by this broker kind.
    pub fn credentials(&self) -> Vec<&Credential> {
        match self {
            BrokerSettings::Redis(redis) => redis.password.iter().collect(),
        }
    }
}

/// Connectivity report for a broker config. Written only by the control loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerHealth {
    pub healthy: bool,
    pub message: String,
    pub checked_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    pub key: BrokerId,
    pub settings: BrokerSettings,
    #[serde(default)]
    pub health: BrokerHealth,
    pub version: u64,
    pub updated_at: u64,
}

// ── Secret ────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Secret {
    pub key: SecretId,
    pub data: BTreeMap<String, String>,
    pub updated_at: u64,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("key", &self.key)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    /// Received a shutdown signal and is draining.
    Terminating,
    Succeeded,
    Failed,
    OomKilled,
}

impl InstanceStatus {
    /// Whether the instance counts toward `current_replicas`.
    ///
    /// A terminating instance has already consumed a shutdown signal and is
    /// on its way out, so it no longer counts.
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceStatus::Pending | InstanceStatus::Running)
    }
}

/// A worker instance owned by a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    /// `{workload}-{uuid}`.
    pub name: String,
    pub workload: WorkloadId,
    pub template_hash: String,
    /// Per-slot requests the instance was created with.
    pub requests: Vec<Resources>,
    /// Latest observed per-slot usage.
    #[serde(default)]
    pub usage: Vec<Resources>,
    pub status: InstanceStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Instance {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.workload, &self.name)
    }
}

pub(crate) fn instance_key(workload: &WorkloadId, name: &str) -> String {
    format!("{}:{}", workload.table_key(), name)
}

// ── Change feed ───────────────────────────────────────────────────

/// An instance was killed for exceeding its memory limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OomKill {
    pub workload: WorkloadId,
    pub instance: String,
    /// Slot that was killed, when the runtime reports it.
    pub container: Option<usize>,
}

/// Change notification published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    WorkloadChanged(WorkloadId),
    WorkloadDeleted(WorkloadId),
    InstanceChanged(WorkloadId),
    BrokerConfigChanged(BrokerId),
    BrokerConfigDeleted(BrokerId),
    SecretChanged(SecretId),
    InstanceOomKilled(OomKill),
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
