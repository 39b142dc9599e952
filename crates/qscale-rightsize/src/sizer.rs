//! High-water-mark tracking and request sizing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use qscale_state::{Instance, InstanceTemplate, OomKill, Resources, WorkloadId, WorkloadStatus};

use crate::source::{MetricsError, MetricsSource};
use crate::threshold::exceeds;

#[derive(Debug, Clone)]
pub struct RightSizingConfig {
    /// Minimum relative increase, in percent, before a mark moves.
    pub threshold_percent: f64,
    /// Memory step applied to a slot after an OOM kill, in percent.
    pub oom_step_percent: u64,
}

impl Default for RightSizingConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 10.0,
            oom_step_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Cpu,
    Memory,
}

/// One high-water-mark that moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkChange {
    pub slot: usize,
    pub dimension: Dimension,
    pub from: u64,
    pub to: u64,
}

/// Zeroed marks, one per container slot of `template`.
pub fn reset_watermarks(template: &InstanceTemplate) -> Vec<Resources> {
    vec![Resources::default(); template.containers.len()]
}

/// Raise each slot's marks to the peak sample when the peak clears the threshold.
///
/// `samples` holds one per-slot usage vector per instance; vectors shorter
/// than `marks` simply contribute nothing for the missing slots.
pub fn raise_watermarks(
    marks: &mut [Resources],
    samples: &[Vec<Resources>],
    threshold_percent: f64,
) -> Vec<WatermarkChange> {
    let mut changes = Vec::new();
    for (slot, mark) in marks.iter_mut().enumerate() {
        let slot_samples = || samples.iter().filter_map(move |s| s.get(slot));
        let peak_cpu = slot_samples().map(|r| r.cpu_millis).max().unwrap_or(0);
        let peak_memory = slot_samples().map(|r| r.memory_bytes).max().unwrap_or(0);

        if exceeds(mark.cpu_millis as f64, peak_cpu as f64, threshold_percent) {
            changes.push(WatermarkChange {
                slot,
                dimension: Dimension::Cpu,
                from: mark.cpu_millis,
                to: peak_cpu,
            });
            mark.cpu_millis = peak_cpu;
        }
        if exceeds(mark.memory_bytes as f64, peak_memory as f64, threshold_percent) {
            changes.push(WatermarkChange {
                slot,
                dimension: Dimension::Memory,
                from: mark.memory_bytes,
                to: peak_memory,
            });
            mark.memory_bytes = peak_memory;
        }
    }
    changes
}

/// Step up the memory mark of `slot` (every slot when `None`) by `step_percent`.
///
/// A zero mark steps up from the killed instance's request for that slot.
/// The step is at least one byte so that repeated kills always make progress.
pub fn oom_bump(
    marks: &mut [Resources],
    slot: Option<usize>,
    requests: &[Resources],
    step_percent: u64,
) -> Vec<WatermarkChange> {
    let slots: Vec<usize> = match slot {
        Some(s) if s < marks.len() => vec![s],
        Some(s) => {
            debug!(slot = s, slots = marks.len(), "OOM slot out of range, ignoring");
            Vec::new()
        }
        None => (0..marks.len()).collect(),
    };

    let mut changes = Vec::new();
    for s in slots {
        let from = marks[s].memory_bytes;
        let base = if from == 0 {
            requests.get(s).map(|r| r.memory_bytes).unwrap_or(0)
        } else {
            from
        };
        if base == 0 {
            warn!(slot = s, "no memory baseline for OOM step-up");
            continue;
        }
        let step = (base.saturating_mul(step_percent) / 100).max(1);
        let to = base.saturating_add(step);
        marks[s].memory_bytes = to;
        changes.push(WatermarkChange {
            slot: s,
            dimension: Dimension::Memory,
            from,
            to,
        });
    }
    changes
}

/// Per-slot requests for a new instance.
pub fn sized_requests(
    template: &InstanceTemplate,
    marks: &[Resources],
    right_sizing: bool,
) -> Vec<Resources> {
    template
        .containers
        .iter()
        .enumerate()
        .map(|(slot, container)| {
            let mut requests = container.resources;
            if right_sizing && let Some(mark) = marks.get(slot) {
                if mark.cpu_millis > 0 {
                    requests.cpu_millis = mark.cpu_millis;
                }
                if mark.memory_bytes > 0 {
                    requests.memory_bytes = mark.memory_bytes;
                }
            }
            requests
        })
        .collect()
}

/// Periodic sampling plus the reactive OOM path.
///
/// OOM kills arrive asynchronously; they are parked per workload and applied
/// at the start of that workload's next pass, so marks are only ever written
/// by the pass that owns the workload's status.
pub struct RightSizer {
    source: Arc<dyn MetricsSource>,
    config: RightSizingConfig,
    pending: Mutex<HashMap<WorkloadId, Vec<OomKill>>>,
}

impl RightSizer {
    pub fn new(source: Arc<dyn MetricsSource>, config: RightSizingConfig) -> Self {
        Self {
            source,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RightSizingConfig {
        &self.config
    }

    /// Sample live instances and raise `status` marks.
    pub async fn sample(
        &self,
        workload: &WorkloadId,
        status: &mut WorkloadStatus,
        instances: &[Instance],
    ) -> Vec<WatermarkChange> {
        let mut samples = Vec::with_capacity(instances.len());
        for instance in instances.iter().filter(|i| i.status.is_live()) {
            match self.source.container_usage(instance).await {
                Ok(usage) => samples.push(usage),
                Err(MetricsError::Unavailable(_)) => {
                    debug!(%workload, instance = %instance.name, "no usage yet, skipping");
                }
                Err(e) => {
                    warn!(%workload, instance = %instance.name, error = %e, "usage sample failed");
                }
            }
        }

        let changes = raise_watermarks(
            &mut status.max_container_resource_usage,
            &samples,
            self.config.threshold_percent,
        );
        for c in &changes {
            info!(
                %workload,
                slot = c.slot,
                dimension = ?c.dimension,
                from = c.from,
                to = c.to,
                "high-water-mark raised"
            );
        }
        changes
    }

    /// Park an OOM kill until its workload's next pass.
    pub async fn record_oom(&self, kill: OomKill) {
        info!(workload = %kill.workload, instance = %kill.instance, container = ?kill.container, "OOM kill recorded");
        self.pending
            .lock()
            .await
            .entry(kill.workload.clone())
            .or_default()
            .push(kill);
    }

    /// OOM kills waiting for `workload`, oldest first.
    pub async fn pending_oom(&self, workload: &WorkloadId) -> Vec<OomKill> {
        self.pending
            .lock()
            .await
            .get(workload)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply `kills` to `status`. `instances` supplies request baselines.
    pub fn apply_oom(
        &self,
        status: &mut WorkloadStatus,
        kills: &[OomKill],
        instances: &[Instance],
    ) -> Vec<WatermarkChange> {
        let mut changes = Vec::new();
        for kill in kills {
            let requests = instances
                .iter()
                .find(|i| i.name == kill.instance)
                .map(|i| i.requests.as_slice())
                .unwrap_or(&[]);
            let applied = oom_bump(
                &mut status.max_container_resource_usage,
                kill.container,
                requests,
                self.config.oom_step_percent,
            );
            for c in &applied {
                info!(
                    workload = %kill.workload,
                    instance = %kill.instance,
                    slot = c.slot,
                    from = c.from,
                    to = c.to,
                    "memory stepped up after OOM kill"
                );
            }
            changes.extend(applied);
        }
        changes
    }

    /// Drop the first `applied` parked kills for `workload` once their
    /// effect has been persisted.
    pub async fn ack_oom(&self, workload: &WorkloadId, applied: usize) {
        if applied == 0 {
            return;
        }
        let mut pending = self.pending.lock().await;
        if let Some(kills) = pending.get_mut(workload) {
            kills.drain(..applied.min(kills.len()));
            if kills.is_empty() {
                pending.remove(workload);
            }
        }
    }

    /// Discard parked kills for a workload that no longer exists.
    pub async fn forget(&self, workload: &WorkloadId) {
        self.pending.lock().await.remove(workload);
    }
}
