//! Store traits consumed by the control loop.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{SecretError, StateResult};
use crate::types::*;

/// Workloads, instances and broker configs.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_workload(&self, key: &WorkloadId) -> StateResult<Option<Workload>>;

    async fn list_workloads(&self) -> StateResult<Vec<Workload>>;

    /// Persist `status` if the stored version still equals `expected_version`.
    ///
    /// Returns the new version. Fails with `Conflict` on a stale token and
    /// `NotFound` if the workload was deleted.
    async fn update_workload_status(
        &self,
        key: &WorkloadId,
        status: &WorkloadStatus,
        expected_version: u64,
    ) -> StateResult<u64>;

    async fn create_instance(&self, instance: &Instance) -> StateResult<()>;

    async fn list_instances(&self, workload: &WorkloadId) -> StateResult<Vec<Instance>>;

    async fn get_broker_config(&self, key: &BrokerId) -> StateResult<Option<BrokerConfig>>;

    async fn list_broker_configs(&self) -> StateResult<Vec<BrokerConfig>>;

    /// Record connectivity for a broker config. Publishes no change event.
    async fn update_broker_health(
        &self,
        key: &BrokerId,
        health: &BrokerHealth,
    ) -> StateResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Opaque secret values.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, SecretError>;
}
