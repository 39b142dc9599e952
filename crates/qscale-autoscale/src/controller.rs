//! Control loop driving passes from store changes and a periodic tick.
//!
//! Every trigger becomes a [`WorkKey`] on one [`WorkQueue`]; a fixed pool of
//! workers drains it. The queue guarantees a key is never worked on by two
//! workers at once, so passes for one workload are strictly sequential
//! while different workloads proceed in parallel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use qscale_broker::{BrokerProvider, SyncOutcome};
use qscale_rightsize::RightSizer;
use qscale_state::{BrokerId, EntityStore, StateResult, StoreEvent, WorkloadId};

use crate::error::ReconcileError;
use crate::queue::WorkQueue;
use crate::reconciler::{PassOutcome, ReconcilerConfig, WorkloadReconciler};

/// Unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkKey {
    Workload(WorkloadId),
    BrokerConfig(BrokerId),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Resync period: every workload and broker config is queued this often.
    pub interval: Duration,
    pub workers: usize,
    /// Delay before a failed key is queued again.
    pub retry_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            workers: 4,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

pub struct Controller {
    store: Arc<dyn EntityStore>,
    brokers: Arc<BrokerProvider>,
    sizer: Arc<RightSizer>,
    reconciler: WorkloadReconciler,
    queue: WorkQueue<WorkKey>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn EntityStore>,
        brokers: Arc<BrokerProvider>,
        sizer: Arc<RightSizer>,
        reconciler_config: ReconcilerConfig,
        config: ControllerConfig,
    ) -> Self {
        let reconciler = WorkloadReconciler::new(
            store.clone(),
            brokers.clone(),
            sizer.clone(),
            reconciler_config,
        );
        Self {
            store,
            brokers,
            sizer,
            reconciler,
            queue: WorkQueue::new(),
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue<WorkKey> {
        &self.queue
    }

    /// Queue every broker config and workload. Returns how many keys were new.
    pub async fn enqueue_all(&self) -> StateResult<usize> {
        let mut queued = 0;
        for config in self.store.list_broker_configs().await? {
            queued += self.queue.enqueue(WorkKey::BrokerConfig(config.key)).await as usize;
        }
        for workload in self.store.list_workloads().await? {
            queued += self.queue.enqueue(WorkKey::Workload(workload.key)).await as usize;
        }
        Ok(queued)
    }

    /// Map one change notification onto work keys.
    pub async fn handle_event(&self, event: StoreEvent) {
        debug!(?event, "store event");
        match event {
            StoreEvent::WorkloadChanged(key) | StoreEvent::InstanceChanged(key) => {
                self.queue.enqueue(WorkKey::Workload(key)).await;
            }
            StoreEvent::WorkloadDeleted(key) => {
                self.sizer.forget(&key).await;
                self.queue.enqueue(WorkKey::Workload(key)).await;
            }
            StoreEvent::BrokerConfigChanged(id) | StoreEvent::BrokerConfigDeleted(id) => {
                self.queue.enqueue(WorkKey::BrokerConfig(id)).await;
            }
            StoreEvent::SecretChanged(secret) => {
                for id in self.brokers.secret_changed(&secret).await {
                    debug!(%secret, broker = %id, "secret changed, resyncing broker");
                    self.queue.enqueue(WorkKey::BrokerConfig(id)).await;
                }
            }
            StoreEvent::InstanceOomKilled(kill) => {
                let key = kill.workload.clone();
                self.sizer.record_oom(kill).await;
                self.queue.enqueue(WorkKey::Workload(key)).await;
            }
        }
    }

    /// Run the work for one key.
    pub async fn process(
        &self,
        key: &WorkKey,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        match key {
            WorkKey::Workload(id) => match self.reconciler.reconcile(id, cancel).await? {
                PassOutcome::Converged(report) => {
                    debug!(
                        workload = %id,
                        current = report.current_replicas,
                        desired = report.desired_replicas,
                        created = report.created,
                        signaled = report.signaled,
                        "pass converged"
                    );
                    Ok(())
                }
                PassOutcome::Invalid(_) | PassOutcome::Gone => Ok(()),
            },
            WorkKey::BrokerConfig(id) => {
                let outcome = self.brokers.sync(id).await?;
                debug!(broker = %id, ?outcome, "broker synced");
                // Workloads on this broker resample against the fresh client.
                if outcome != SyncOutcome::Removed {
                    for workload in self.store.list_workloads().await? {
                        if workload.spec.broker_key(&workload.key.namespace) == *id {
                            self.queue.enqueue(WorkKey::Workload(workload.key)).await;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Process queued keys on the calling task until none are left.
    pub async fn drain(&self) -> usize {
        let (_keep, cancel) = watch::channel(false);
        let mut processed = 0;
        while let Some(key) = self.queue.try_next().await {
            if let Err(e) = self.process(&key, cancel.clone()).await {
                warn!(?key, error = %e, "work failed");
            }
            self.queue.done(&key).await;
            processed += 1;
        }
        processed
    }

    /// Run until `shutdown` flips. In-flight passes are cancelled and awaited.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.workers,
            "controller started"
        );

        let mut events = self.store.subscribe();
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|n| tokio::spawn(self.clone().worker(n, shutdown.clone())))
            .collect();

        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.enqueue_all().await {
                        error!(error = %e, "resync failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, resyncing everything");
                        if let Err(e) = self.enqueue_all().await {
                            error!(error = %e, "resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("change feed closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("controller shutting down");
                    break;
                }
            }
        }

        self.queue.close().await;
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker panicked");
            }
        }
        info!("controller stopped");
    }

    async fn worker(self: Arc<Self>, n: usize, shutdown: watch::Receiver<bool>) {
        debug!(worker = n, "worker started");
        while let Some(key) = self.queue.next().await {
            let result = self.process(&key, shutdown.clone()).await;
            self.queue.done(&key).await;
            match result {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!(worker = n, ?key, error = %e, "work failed, retrying");
                    self.retry_later(key);
                }
                Err(e) => debug!(worker = n, ?key, error = %e, "work abandoned"),
            }
        }
        debug!(worker = n, "worker stopped");
    }

    fn retry_later(self: &Arc<Self>, key: WorkKey) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.config.retry_backoff).await;
            this.queue.enqueue(key).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qscale_broker::testing::MemoryConnector;
    use qscale_broker::{BrokerRegistry, SecretResolver};
    use qscale_rightsize::RightSizingConfig;
    use qscale_state::{
        BrokerSettings, ContainerTemplate, Credential, InstanceTemplate, OomKill, RedisSettings,
        Resources, SecretId, SecretKeyRef, StateStore, WorkloadSpec,
    };
    use std::collections::BTreeMap;
    use tokio::sync::broadcast;

    fn broker_id() -> BrokerId {
        BrokerId::new("default", "redis")
    }

    fn workload(name: &str) -> WorkloadId {
        WorkloadId::new("default", name)
    }

    fn spec(max: u32) -> WorkloadSpec {
        WorkloadSpec {
            queue: "jobs".to_string(),
            broker_config_ref: "redis".to_string(),
            min_replicas: 0,
            max_replicas: max,
            scaling_factor: 1,
            right_sizing: false,
            template: InstanceTemplate {
                containers: vec![ContainerTemplate {
                    name: "worker".to_string(),
                    image: "worker:1".to_string(),
                    resources: Resources::new(100, 64 * 1024 * 1024),
                    ..Default::default()
                }],
                labels: Default::default(),
            },
        }
    }

    fn setup() -> (StateStore, Arc<MemoryConnector>, Arc<Controller>) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_secret(
                &SecretId::new("default", "redis-creds"),
                BTreeMap::from([("password".to_string(), "one".to_string())]),
            )
            .unwrap();
        store
            .put_broker_config(
                &broker_id(),
                BrokerSettings::Redis(RedisSettings {
                    host: "redis.local".to_string(),
                    port: 6379,
                    db: 0,
                    password: Some(Credential::SecretKeyRef(SecretKeyRef {
                        name: "redis-creds".to_string(),
                        key: "password".to_string(),
                    })),
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
        let sizer = Arc::new(RightSizer::new(shared.clone(), RightSizingConfig::default()));
        let controller = Arc::new(Controller::new(
            shared,
            brokers,
            sizer,
            ReconcilerConfig::default(),
            ControllerConfig {
                interval: Duration::from_millis(50),
                workers: 2,
                retry_backoff: Duration::from_millis(20),
            },
        ));
        (store, connector, controller)
    }

    async fn pump(controller: &Controller, events: &mut broadcast::Receiver<StoreEvent>) {
        while let Ok(event) = events.try_recv() {
            controller.handle_event(event).await;
        }
    }

    fn live(store: &StateStore, key: &WorkloadId) -> usize {
        store
            .list_instances(key)
            .unwrap()
            .iter()
            .filter(|i| i.status.is_live())
            .count()
    }

    #[tokio::test]
    async fn events_map_to_work_keys() {
        let (store, _, controller) = setup();
        let mut events = store.subscribe();

        store.put_workload(&workload("a"), spec(5)).unwrap();
        store.put_workload(&workload("a"), spec(6)).unwrap();
        pump(&controller, &mut events).await;

        assert_eq!(
            controller.queue().try_next().await,
            Some(WorkKey::Workload(workload("a")))
        );
        assert_eq!(controller.queue().try_next().await, None);
    }

    #[tokio::test]
    async fn enqueue_all_covers_brokers_and_workloads() {
        let (store, _, controller) = setup();
        store.put_workload(&workload("a"), spec(5)).unwrap();
        store.put_workload(&workload("b"), spec(5)).unwrap();

        assert_eq!(controller.enqueue_all().await.unwrap(), 3);
        assert_eq!(controller.enqueue_all().await.unwrap(), 0);
        assert_eq!(
            controller.queue().try_next().await,
            Some(WorkKey::BrokerConfig(broker_id()))
        );
    }

    #[tokio::test]
    async fn drain_converges_workloads() {
        let (store, connector, controller) = setup();
        connector.broker(&broker_id()).set_queue_length("jobs", 3);
        store.put_workload(&workload("a"), spec(5)).unwrap();

        controller.enqueue_all().await.unwrap();
        controller.drain().await;

        assert_eq!(live(&store, &workload("a")), 3);
        let health = store.get_broker_config(&broker_id()).unwrap().unwrap().health;
        assert!(health.healthy);
        assert_eq!(connector.password(&broker_id()).as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn secret_rotation_rebuilds_client() {
        let (store, connector, controller) = setup();
        store.put_workload(&workload("a"), spec(5)).unwrap();
        controller.enqueue_all().await.unwrap();
        controller.drain().await;
        let connects = connector.connects();

        let mut events = store.subscribe();
        store
            .put_secret(
                &SecretId::new("default", "redis-creds"),
                BTreeMap::from([("password".to_string(), "two".to_string())]),
            )
            .unwrap();
        pump(&controller, &mut events).await;
        assert_eq!(controller.queue().len().await, 1);
        controller.drain().await;

        assert_eq!(connector.connects(), connects + 1);
        assert_eq!(connector.password(&broker_id()).as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn oom_event_is_parked_for_the_pass() {
        let (store, connector, controller) = setup();
        connector.broker(&broker_id()).set_queue_length("jobs", 1);
        store.put_workload(&workload("a"), spec(5)).unwrap();
        controller.enqueue_all().await.unwrap();
        controller.drain().await;

        let victim = store.list_instances(&workload("a")).unwrap().remove(0);
        let mut events = store.subscribe();
        store
            .record_oom_kill(&workload("a"), &victim.name, Some(0))
            .unwrap();
        pump(&controller, &mut events).await;
        assert_eq!(
            controller.sizer.pending_oom(&workload("a")).await,
            vec![OomKill {
                workload: workload("a"),
                instance: victim.name.clone(),
                container: Some(0),
            }]
        );

        controller.drain().await;
        assert!(controller.sizer.pending_oom(&workload("a")).await.is_empty());
        assert_eq!(live(&store, &workload("a")), 1);
        let status = store.get_workload(&workload("a")).unwrap().unwrap().status;
        let mark = status.max_container_resource_usage[0].memory_bytes;
        assert!(mark > victim.requests[0].memory_bytes);
    }

    #[tokio::test]
    async fn run_reacts_and_stops() {
        let (store, connector, controller) = setup();
        connector.broker(&broker_id()).set_queue_length("jobs", 2);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.clone().run(rx));

        store.put_workload(&workload("a"), spec(5)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while live(&store, &workload("a")) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        connector.broker(&broker_id()).set_queue_length("jobs", 0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while connector.broker(&broker_id()).signals("jobs") < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(controller.queue().try_next().await.is_none());
    }
}
