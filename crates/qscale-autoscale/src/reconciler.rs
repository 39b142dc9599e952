//! Workload reconciler, one convergence pass per trigger.
//!
//! A pass reads the workload, counts its live instances, samples queue depth
//! through the workload's broker, computes the desired replica count and
//! closes the gap: new instances are created directly, surplus instances
//! are asked to leave through the broker's shutdown-signal queue. Status is
//! written back with the version token read at the start; a conflicting
//! write restarts the pass from a fresh read.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use qscale_broker::{Broker, BrokerProvider};
use qscale_rightsize::{RightSizer, reset_watermarks, sized_requests};
use qscale_state::{
    EntityStore, Instance, InstanceStatus, Resources, StateError, WorkloadId, WorkloadPhase,
    WorkloadStatus, epoch_secs,
};

use crate::budget::PassBudget;
use crate::decision::{ScaleAction, desired_replicas};
use crate::error::ReconcileError;
use crate::template::template_hash;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on the wall time of one pass, across all its I/O.
    pub pass_timeout: Duration,
    /// Full-pass restarts allowed after status write conflicts.
    pub max_conflict_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pass_timeout: Duration::from_secs(30),
            max_conflict_retries: 5,
        }
    }
}

/// What a finished pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub created: u32,
    /// Shutdown markers sent, including by attempts lost to write conflicts.
    pub signaled: u32,
    /// Queue depth was read successfully this pass.
    pub sampled: bool,
    /// Status write conflicts absorbed before this pass succeeded.
    pub conflicts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The workload no longer exists.
    Gone,
    /// The spec cannot converge; recorded on the status.
    Invalid(String),
    Converged(PassReport),
}

pub struct WorkloadReconciler {
    store: Arc<dyn EntityStore>,
    brokers: Arc<BrokerProvider>,
    sizer: Arc<RightSizer>,
    config: ReconcilerConfig,
}

impl WorkloadReconciler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        brokers: Arc<BrokerProvider>,
        sizer: Arc<RightSizer>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            brokers,
            sizer,
            config,
        }
    }

    /// Run passes for `key` until one persists its status.
    ///
    /// Shutdown markers sent by an attempt whose status write conflicted are
    /// already queued on the broker and are not sent again by the re-run.
    pub async fn reconcile(
        &self,
        key: &WorkloadId,
        cancel: watch::Receiver<bool>,
    ) -> Result<PassOutcome, ReconcileError> {
        let mut budget = PassBudget::new(self.config.pass_timeout, cancel);
        let mut conflicts = 0;
        let mut signaled = 0;
        loop {
            match self.pass(key, &mut budget, &mut signaled).await {
                Err(ReconcileError::State(StateError::Conflict { .. }))
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    debug!(workload = %key, conflicts, "status write conflicted, re-running pass");
                }
                Err(ReconcileError::State(StateError::Conflict { .. })) => {
                    return Err(ReconcileError::ConflictRetriesExhausted {
                        key: key.to_string(),
                        attempts: conflicts + 1,
                    });
                }
                Ok(PassOutcome::Converged(mut report)) => {
                    report.conflicts = conflicts;
                    return Ok(PassOutcome::Converged(report));
                }
                other => return other,
            }
        }
    }

    /// One attempt. `signaled` counts markers sent by earlier attempts of
    /// the same reconcile and is advanced by this one.
    async fn pass(
        &self,
        key: &WorkloadId,
        budget: &mut PassBudget,
        signaled: &mut u32,
    ) -> Result<PassOutcome, ReconcileError> {
        let Some(workload) = budget
            .run("get workload", self.store.get_workload(key))
            .await??
        else {
            self.sizer.forget(key).await;
            debug!(workload = %key, "workload gone");
            return Ok(PassOutcome::Gone);
        };
        let spec = &workload.spec;
        let mut status = workload.status.clone();

        if let Err(reason) = spec.validate() {
            warn!(workload = %key, %reason, "workload spec invalid");
            if status.phase != WorkloadPhase::Invalid
                || status.message.as_deref() != Some(&reason)
            {
                status.phase = WorkloadPhase::Invalid;
                status.message = Some(reason.clone());
                if !self.persist(key, &status, workload.version, budget).await? {
                    return Ok(PassOutcome::Gone);
                }
            }
            return Ok(PassOutcome::Invalid(reason));
        }

        let instances = budget
            .run("list instances", self.store.list_instances(key))
            .await??;
        let live: Vec<Instance> = instances
            .iter()
            .filter(|i| i.status.is_live())
            .cloned()
            .collect();
        status.current_replicas = u32::try_from(live.len()).unwrap_or(u32::MAX);

        let hash = template_hash(&spec.template);
        if status.template_hash != hash
            || status.max_container_resource_usage.len() != spec.template.containers.len()
        {
            if !status.template_hash.is_empty() {
                info!(workload = %key, "template changed, resetting high-water-marks");
            }
            status.template_hash = hash.clone();
            status.max_container_resource_usage = reset_watermarks(&spec.template);
        }

        let kills = self.sizer.pending_oom(key).await;
        if !kills.is_empty() {
            self.sizer.apply_oom(&mut status, &kills, &instances);
        }

        // ── Sample ─────────────────────────────────────────────────

        let broker_id = spec.broker_key(&key.namespace);
        let broker: Option<Arc<dyn Broker>> =
            match budget.run("acquire broker", self.brokers.acquire(&broker_id)).await? {
                Ok(broker) => Some(broker),
                Err(e) => {
                    warn!(workload = %key, broker = %broker_id, error = %e, "broker unavailable");
                    self.brokers.report_failure(&broker_id, &e).await;
                    status.message = Some(format!("broker unavailable: {e}"));
                    None
                }
            };

        let mut report = PassReport::default();
        let depth = match &broker {
            Some(b) => match budget.run("queue length", b.queue_length(&spec.queue)).await? {
                Ok(depth) => {
                    self.brokers.report_success(&broker_id).await;
                    Some(depth)
                }
                Err(e) => {
                    warn!(workload = %key, queue = %spec.queue, error = %e, "queue depth unavailable");
                    self.brokers.report_failure(&broker_id, &e).await;
                    status.message = Some(format!("queue depth unavailable: {e}"));
                    None
                }
            },
            None => None,
        };

        match depth {
            Some(depth) => {
                status.desired_replicas = desired_replicas(
                    depth,
                    spec.min_replicas,
                    spec.max_replicas,
                    spec.scaling_factor,
                );
                status.last_sampled_at = Some(epoch_secs());
                status.phase = WorkloadPhase::Active;
                status.message = None;
                report.sampled = true;
                debug!(
                    workload = %key,
                    queue_depth = depth,
                    desired = status.desired_replicas,
                    "queue sampled"
                );
            }
            // Keep the last decision, within the current bounds.
            None => {
                status.desired_replicas = status
                    .desired_replicas
                    .max(spec.min_replicas)
                    .min(spec.max_replicas);
            }
        }

        if spec.right_sizing {
            budget
                .run("sample usage", self.sizer.sample(key, &mut status, &live))
                .await?;
        }

        // ── Converge ───────────────────────────────────────────────

        let mut failure = None;
        if status.last_sampled_at.is_none() {
            debug!(workload = %key, "no queue sample yet, not converging");
        } else {
            match ScaleAction::plan(status.current_replicas, status.desired_replicas) {
                ScaleAction::ScaleUp(n) => {
                    let requests = sized_requests(
                        &spec.template,
                        &status.max_container_resource_usage,
                        spec.right_sizing,
                    );
                    for _ in 0..n {
                        let instance = new_instance(key, &hash, requests.clone());
                        match budget
                            .run("create instance", self.store.create_instance(&instance))
                            .await?
                        {
                            Ok(()) => {
                                status.current_replicas += 1;
                                report.created += 1;
                                info!(workload = %key, instance = %instance.name, "instance created");
                            }
                            Err(e) => {
                                warn!(workload = %key, error = %e, "instance creation failed");
                                failure = Some(ReconcileError::CreationFailed {
                                    created: report.created,
                                    requested: n,
                                    source: e,
                                });
                                break;
                            }
                        }
                    }
                }
                // Only signal on a depth read this pass; a stale decision
                // must not shrink the workload.
                ScaleAction::ScaleDown(n) => match broker.as_ref().filter(|_| report.sampled) {
                    None => {
                        debug!(workload = %key, surplus = n, "broker unavailable, deferring scale-down");
                    }
                    Some(b) => {
                        let outstanding = (*signaled).min(n);
                        status.current_replicas -= outstanding;
                        for _ in outstanding..n {
                            match budget
                                .run("signal shutdown", b.signal_graceful_shutdown(&spec.queue))
                                .await?
                            {
                                Ok(()) => {
                                    status.current_replicas -= 1;
                                    *signaled += 1;
                                }
                                Err(e) => {
                                    warn!(workload = %key, error = %e, "shutdown signal failed");
                                    self.brokers.report_failure(&broker_id, &e).await;
                                    failure = Some(ReconcileError::SignalFailed {
                                        sent: *signaled,
                                        requested: n,
                                        source: e,
                                    });
                                    break;
                                }
                            }
                        }
                        if *signaled > outstanding {
                            info!(workload = %key, signaled = *signaled, "scale-down signaled");
                        }
                    }
                },
                ScaleAction::Steady => {}
            }
        }

        report.signaled = *signaled;
        report.current_replicas = status.current_replicas;
        report.desired_replicas = status.desired_replicas;

        if status != workload.status
            && !self.persist(key, &status, workload.version, budget).await?
        {
            return Ok(PassOutcome::Gone);
        }
        self.sizer.ack_oom(key, kills.len()).await;

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(PassOutcome::Converged(report))
    }

    /// Write `status`. Returns false if the workload disappeared.
    async fn persist(
        &self,
        key: &WorkloadId,
        status: &WorkloadStatus,
        version: u64,
        budget: &mut PassBudget,
    ) -> Result<bool, ReconcileError> {
        match budget
            .run(
                "update status",
                self.store.update_workload_status(key, status, version),
            )
            .await?
        {
            Ok(_) => Ok(true),
            Err(StateError::NotFound(_)) => {
                self.sizer.forget(key).await;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn new_instance(key: &WorkloadId, template_hash: &str, requests: Vec<Resources>) -> Instance {
    let now = epoch_secs();
    Instance {
        name: format!("{}-{}", key.name, Uuid::new_v4()),
        workload: key.clone(),
        template_hash: template_hash.to_string(),
        requests,
        usage: Vec::new(),
        status: InstanceStatus::Pending,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qscale_broker::testing::MemoryConnector;
    use qscale_broker::{BrokerRegistry, SecretResolver};
    use qscale_rightsize::RightSizingConfig;
    use qscale_state::{
        BrokerConfig, BrokerHealth, BrokerId, BrokerSettings, ContainerTemplate, InstanceTemplate,
        OomKill, RedisSettings, StateResult, StateStore, StoreEvent, Workload, WorkloadSpec,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    const MIB: u64 = 1024 * 1024;

    struct Harness {
        store: StateStore,
        connector: Arc<MemoryConnector>,
        sizer: Arc<RightSizer>,
        reconciler: WorkloadReconciler,
        _cancel: watch::Sender<bool>,
        cancel: watch::Receiver<bool>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_entities(|store| Arc::new(store))
        }

        /// Harness whose reconciler sees the store through `wrap`.
        fn with_entities(wrap: impl FnOnce(StateStore) -> Arc<dyn EntityStore>) -> Self {
            let store = StateStore::open_in_memory().unwrap();
            store
                .put_broker_config(
                    &broker_id(),
                    BrokerSettings::Redis(RedisSettings {
                        host: "redis.local".to_string(),
                        port: 6379,
                        db: 0,
                        password: None,
                    }),
                )
                .unwrap();
            let connector = Arc::new(MemoryConnector::new());
            let shared = Arc::new(store.clone());
            let brokers = Arc::new(BrokerProvider::new(
                shared.clone(),
                Arc::new(SecretResolver::new(shared.clone())),
                Arc::new(BrokerRegistry::default()),
                connector.clone(),
            ));
            let sizer = Arc::new(RightSizer::new(shared, RightSizingConfig::default()));
            let reconciler = WorkloadReconciler::new(
                wrap(store.clone()),
                brokers,
                sizer.clone(),
                ReconcilerConfig::default(),
            );
            let (tx, rx) = watch::channel(false);
            Self {
                store,
                connector,
                sizer,
                reconciler,
                _cancel: tx,
                cancel: rx,
            }
        }

        async fn pass(&self) -> Result<PassOutcome, ReconcileError> {
            self.reconciler.reconcile(&key(), self.cancel.clone()).await
        }

        fn set_depth(&self, depth: u64) {
            self.connector.broker(&broker_id()).set_queue_length("jobs", depth);
        }

        fn signals(&self) -> usize {
            self.connector.broker(&broker_id()).signals("jobs")
        }

        fn status(&self) -> WorkloadStatus {
            self.store.get_workload(&key()).unwrap().unwrap().status
        }

        fn live(&self) -> Vec<Instance> {
            self.store
                .list_instances(&key())
                .unwrap()
                .into_iter()
                .filter(|i| i.status.is_live())
                .collect()
        }
    }

    fn key() -> WorkloadId {
        WorkloadId::new("default", "resize")
    }

    fn broker_id() -> BrokerId {
        BrokerId::new("default", "redis")
    }

    fn spec(min: u32, max: u32) -> WorkloadSpec {
        WorkloadSpec {
            queue: "jobs".to_string(),
            broker_config_ref: "redis".to_string(),
            min_replicas: min,
            max_replicas: max,
            scaling_factor: 1,
            right_sizing: false,
            template: InstanceTemplate {
                containers: vec![ContainerTemplate {
                    name: "worker".to_string(),
                    image: "worker:1".to_string(),
                    resources: Resources::new(100, 64 * MIB),
                    ..Default::default()
                }],
                labels: Default::default(),
            },
        }
    }

    fn converged(outcome: PassOutcome) -> PassReport {
        match outcome {
            PassOutcome::Converged(report) => report,
            other => panic!("expected converged pass, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scales_up_to_queue_depth() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(1, 5)).unwrap();
        h.set_depth(3);

        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.created, 3);
        assert_eq!(report.desired_replicas, 3);
        assert_eq!(h.live().len(), 3);

        let status = h.status();
        assert_eq!(status.current_replicas, 3);
        assert_eq!(status.desired_replicas, 3);
        assert_eq!(status.phase, WorkloadPhase::Active);
        assert_eq!(status.template_hash, template_hash(&spec(1, 5).template));
        for i in h.live() {
            assert_eq!(i.template_hash, status.template_hash);
            assert!(i.name.starts_with("resize-"));
        }
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(1, 5)).unwrap();
        h.set_depth(4);

        h.pass().await.unwrap();
        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.created, 0);
        assert_eq!(report.signaled, 0);
        assert_eq!(h.live().len(), 4);
        assert_eq!(h.signals(), 0);
    }

    #[tokio::test]
    async fn empty_queue_holds_min() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(2, 5)).unwrap();
        h.set_depth(0);

        converged(h.pass().await.unwrap());
        assert_eq!(h.live().len(), 2);
    }

    #[tokio::test]
    async fn scale_down_signals_without_deleting() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(1, 10)).unwrap();
        h.set_depth(5);
        h.pass().await.unwrap();
        assert_eq!(h.live().len(), 5);

        h.set_depth(1);
        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.signaled, 4);
        assert_eq!(h.signals(), 4);
        // Instances leave on their own after draining.
        assert_eq!(h.live().len(), 5);
        assert_eq!(h.status().current_replicas, 1);
    }

    #[tokio::test]
    async fn broker_outage_keeps_prior_decision() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(1, 10)).unwrap();
        h.set_depth(4);
        h.pass().await.unwrap();

        h.connector.broker(&broker_id()).fail_queries(true);
        let report = converged(h.pass().await.unwrap());
        assert!(!report.sampled);
        assert_eq!(report.desired_replicas, 4);
        assert_eq!(h.live().len(), 4);
        assert_eq!(h.signals(), 0);

        let status = h.status();
        assert_eq!(status.desired_replicas, 4);
        assert!(status.message.unwrap().contains("queue depth unavailable"));
        let health = h.store.get_broker_config(&broker_id()).unwrap().unwrap().health;
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn no_sample_ever_means_no_convergence() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(2, 10)).unwrap();
        h.connector.refuse_connections(true);

        let report = converged(h.pass().await.unwrap());
        assert!(!report.sampled);
        assert_eq!(report.created, 0);
        assert!(h.live().is_empty());
        assert_eq!(h.status().phase, WorkloadPhase::Pending);
    }

    #[tokio::test]
    async fn scale_down_deferred_without_broker() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(1, 10)).unwrap();
        h.set_depth(3);
        h.pass().await.unwrap();

        // Shrink max while the broker is down: desired re-clamps to 2 but
        // nothing can be signaled.
        h.store.put_workload(&key(), spec(1, 2)).unwrap();
        h.connector.broker(&broker_id()).set_connected(false);
        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.desired_replicas, 2);
        assert_eq!(report.signaled, 0);
        assert_eq!(h.status().current_replicas, 3);
    }

    #[tokio::test]
    async fn partial_signal_failure_is_surfaced() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(0, 10)).unwrap();
        h.set_depth(4);
        h.pass().await.unwrap();

        h.set_depth(0);
        h.connector.broker(&broker_id()).limit_signals(Some(1));
        let err = h.pass().await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::SignalFailed {
                sent: 1,
                requested: 4,
                ..
            }
        ));
        assert_eq!(h.signals(), 1);
        assert_eq!(h.status().current_replicas, 3);
    }

    #[tokio::test]
    async fn invalid_bounds_are_recorded_not_retried() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(5, 2)).unwrap();
        h.set_depth(3);

        let outcome = h.pass().await.unwrap();
        assert!(matches!(outcome, PassOutcome::Invalid(ref r) if r.contains("exceeds")));
        let status = h.status();
        assert_eq!(status.phase, WorkloadPhase::Invalid);
        assert!(h.live().is_empty());

        // A second pass does not rewrite an unchanged status.
        let version = h.store.get_workload(&key()).unwrap().unwrap().version;
        h.pass().await.unwrap();
        assert_eq!(h.store.get_workload(&key()).unwrap().unwrap().version, version);
    }

    #[tokio::test]
    async fn missing_workload_is_gone() {
        let h = Harness::new();
        assert_eq!(h.pass().await.unwrap(), PassOutcome::Gone);
    }

    #[tokio::test]
    async fn right_sizing_shapes_new_instances() {
        let h = Harness::new();
        let mut s = spec(1, 10);
        s.right_sizing = true;
        h.store.put_workload(&key(), s).unwrap();
        h.set_depth(1);
        h.pass().await.unwrap();

        let first = h.live().remove(0);
        h.store
            .record_usage(&key(), &first.name, vec![Resources::new(300, 200 * MIB)])
            .unwrap();
        h.set_depth(2);
        h.pass().await.unwrap();

        let status = h.status();
        assert_eq!(
            status.max_container_resource_usage,
            vec![Resources::new(300, 200 * MIB)]
        );
        let newest = h
            .live()
            .into_iter()
            .find(|i| i.name != first.name)
            .unwrap();
        assert_eq!(newest.requests, vec![Resources::new(300, 200 * MIB)]);
    }

    #[tokio::test]
    async fn template_change_resets_marks() {
        let h = Harness::new();
        let mut s = spec(1, 10);
        s.right_sizing = true;
        h.store.put_workload(&key(), s.clone()).unwrap();
        h.set_depth(1);
        h.pass().await.unwrap();
        let inst = h.live().remove(0);
        h.store
            .record_usage(&key(), &inst.name, vec![Resources::new(300, 200 * MIB)])
            .unwrap();
        h.pass().await.unwrap();
        assert!(!h.status().max_container_resource_usage[0].is_zero());

        s.template.containers[0].image = "worker:2".to_string();
        s.template.containers.push(ContainerTemplate {
            name: "sidecar".to_string(),
            image: "sidecar:1".to_string(),
            ..Default::default()
        });
        s.right_sizing = false;
        h.store.put_workload(&key(), s.clone()).unwrap();
        h.pass().await.unwrap();

        let status = h.status();
        assert_eq!(status.template_hash, template_hash(&s.template));
        assert_eq!(status.max_container_resource_usage, vec![Resources::default(); 2]);
    }

    #[tokio::test]
    async fn oom_kill_steps_memory_and_replaces_instance() {
        let h = Harness::new();
        let mut s = spec(1, 10);
        s.right_sizing = true;
        h.store.put_workload(&key(), s).unwrap();
        h.set_depth(1);
        h.pass().await.unwrap();

        let victim = h.live().remove(0);
        h.store.record_oom_kill(&key(), &victim.name, Some(0)).unwrap();
        h.sizer
            .record_oom(OomKill {
                workload: key(),
                instance: victim.name.clone(),
                container: Some(0),
            })
            .await;

        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.created, 1);

        // Zero mark steps up from the victim's 64 MiB request.
        let expected = 64 * MIB + 64 * MIB / 10;
        assert_eq!(h.status().max_container_resource_usage[0].memory_bytes, expected);
        assert!(h.sizer.pending_oom(&key()).await.is_empty());

        let replacement = h.live().remove(0);
        assert_eq!(replacement.requests[0].memory_bytes, expected);
    }

    /// Interference a [`ScriptedStore`] injects into the reconciler's writes.
    #[derive(Clone, Default)]
    struct Hooks {
        /// Status writes still to be preceded by a competing spec write.
        races: Arc<AtomicU32>,
        /// Instance creations left before the sender fires.
        shutdown_after: Arc<std::sync::Mutex<Option<(u32, watch::Sender<bool>)>>>,
    }

    impl Hooks {
        fn cancel_after(&self, creations: u32, tx: watch::Sender<bool>) {
            *self.shutdown_after.lock().unwrap() = Some((creations, tx));
        }
    }

    /// Store that lets another writer slip in before status writes, and can
    /// cancel the pass once some instances are committed.
    struct ScriptedStore {
        inner: StateStore,
        hooks: Hooks,
    }

    #[async_trait]
    impl EntityStore for ScriptedStore {
        async fn get_workload(&self, key: &WorkloadId) -> StateResult<Option<Workload>> {
            self.inner.get_workload(key)
        }

        async fn list_workloads(&self) -> StateResult<Vec<Workload>> {
            self.inner.list_workloads()
        }

        async fn update_workload_status(
            &self,
            key: &WorkloadId,
            status: &WorkloadStatus,
            expected_version: u64,
        ) -> StateResult<u64> {
            let racing = self
                .hooks
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if racing && let Some(current) = self.inner.get_workload(key)? {
                self.inner.put_workload(key, current.spec)?;
            }
            self.inner.update_workload_status(key, status, expected_version)
        }

        async fn create_instance(&self, instance: &Instance) -> StateResult<()> {
            self.inner.create_instance(instance)?;
            let mut armed = self.hooks.shutdown_after.lock().unwrap();
            if let Some((left, tx)) = armed.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    tx.send_replace(true);
                    *armed = None;
                }
            }
            Ok(())
        }

        async fn list_instances(&self, workload: &WorkloadId) -> StateResult<Vec<Instance>> {
            self.inner.list_instances(workload)
        }

        async fn get_broker_config(&self, key: &BrokerId) -> StateResult<Option<BrokerConfig>> {
            self.inner.get_broker_config(key)
        }

        async fn list_broker_configs(&self) -> StateResult<Vec<BrokerConfig>> {
            self.inner.list_broker_configs()
        }

        async fn update_broker_health(
            &self,
            key: &BrokerId,
            health: &BrokerHealth,
        ) -> StateResult<()> {
            self.inner.update_broker_health(key, health)
        }

        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.inner.subscribe()
        }
    }

    fn scripted() -> (Harness, Hooks) {
        let hooks = Hooks::default();
        let wired = hooks.clone();
        let h = Harness::with_entities(move |inner| {
            Arc::new(ScriptedStore {
                inner,
                hooks: wired,
            })
        });
        (h, hooks)
    }

    #[tokio::test]
    async fn conflicting_writer_forces_rerun() {
        let (h, hooks) = scripted();
        hooks.races.store(2, Ordering::SeqCst);
        h.store.put_workload(&key(), spec(1, 5)).unwrap();
        h.set_depth(2);

        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.conflicts, 2);
        // Instances created by the lost passes are counted, not duplicated.
        assert_eq!(report.created, 0);
        assert_eq!(h.live().len(), 2);
        assert_eq!(h.status().desired_replicas, 2);
        assert_eq!(h.status().current_replicas, 2);
    }

    #[tokio::test]
    async fn conflict_retries_are_bounded() {
        let (h, hooks) = scripted();
        hooks.races.store(100, Ordering::SeqCst);
        h.store.put_workload(&key(), spec(1, 5)).unwrap();
        h.set_depth(1);

        let err = h.pass().await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::ConflictRetriesExhausted { attempts: 6, .. }
        ));
        assert!(err.is_retryable());
        assert_eq!(h.live().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_scale_down_does_not_resend_signals() {
        let (h, hooks) = scripted();
        h.store.put_workload(&key(), spec(1, 10)).unwrap();
        h.set_depth(5);
        converged(h.pass().await.unwrap());
        assert_eq!(h.live().len(), 5);

        hooks.races.store(1, Ordering::SeqCst);
        h.set_depth(0);
        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.conflicts, 1);
        // Markers from the lost attempt are already queued; the re-run
        // counts them instead of sending four more.
        assert_eq!(report.signaled, 4);
        assert_eq!(h.signals(), 4);
        assert_eq!(h.status().current_replicas, 1);
        assert_eq!(h.status().desired_replicas, 1);
    }

    #[tokio::test]
    async fn cancelled_scale_up_keeps_committed_instances() {
        let (h, hooks) = scripted();
        h.store.put_workload(&key(), spec(1, 10)).unwrap();
        h.set_depth(5);

        let (tx, rx) = watch::channel(false);
        hooks.cancel_after(2, tx);
        let err = h.reconciler.reconcile(&key(), rx).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled));
        assert_eq!(h.live().len(), 2);

        let report = converged(h.pass().await.unwrap());
        assert_eq!(report.created, 3);
        assert_eq!(h.live().len(), 5);
        assert_eq!(h.status().current_replicas, 5);
    }

    #[tokio::test]
    async fn cancelled_pass_stops() {
        let h = Harness::new();
        h.store.put_workload(&key(), spec(1, 5)).unwrap();
        let (tx, rx) = watch::channel(true);
        let err = h.reconciler.reconcile(&key(), rx).await.unwrap_err();
        drop(tx);
        assert!(matches!(err, ReconcileError::Cancelled));
        assert!(!err.is_retryable());
    }
}
