//! Per-container usage samples.

use async_trait::async_trait;
use thiserror::Error;

use qscale_state::{Instance, Resources, StateStore};

#[derive(Debug, Error)]
pub enum MetricsError {
    /// The instance exists but has not reported usage yet.
    #[error("no usage reported for {0}")]
    Unavailable(String),

    #[error("metrics source error: {0}")]
    Source(String),
}

/// Supplies the latest observed per-slot usage of an instance.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn container_usage(&self, instance: &Instance) -> Result<Vec<Resources>, MetricsError>;
}

/// Usage as last recorded on the instance record.
#[async_trait]
impl MetricsSource for StateStore {
    async fn container_usage(&self, instance: &Instance) -> Result<Vec<Resources>, MetricsError> {
        let current = self
            .get_instance(&instance.workload, &instance.name)
            .map_err(|e| MetricsError::Source(e.to_string()))?
            .ok_or_else(|| MetricsError::Unavailable(instance.name.clone()))?;
        if current.usage.is_empty() {
            return Err(MetricsError::Unavailable(instance.name.clone()));
        }
        Ok(current.usage)
    }
}
