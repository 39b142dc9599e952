//! Broker registry — one live client per broker config identity.
//!
//! Each identity owns a slot guarded by its own async mutex. Construction
//! runs while holding only that slot's lock, so concurrent acquisitions of
//! the same identity run the factory at most once and share the result,
//! while acquisitions of other identities proceed in parallel. A factory
//! that fails leaves the slot empty, and empty slots nobody else holds
//! are dropped from the map.
//!
//! Entries are never mutated in place beyond failure accounting: a config
//! or credential change goes through [`BrokerRegistry::replace`], and
//! repeated connectivity failures evict the entry so that the next
//! acquisition reconnects.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use qscale_state::BrokerId;

use crate::client::Broker;
use crate::error::{BrokerError, BrokerResult};

/// Default consecutive failures before an entry is evicted.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

struct Entry {
    broker: Arc<dyn Broker>,
    created_at: Instant,
    consecutive_failures: u32,
}

impl Entry {
    fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            created_at: Instant::now(),
            consecutive_failures: 0,
        }
    }
}

type Slot = Arc<Mutex<Option<Entry>>>;

pub struct BrokerRegistry {
    slots: RwLock<HashMap<BrokerId, Slot>>,
    failure_threshold: u32,
}

impl BrokerRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    async fn slot(&self, id: &BrokerId) -> Slot {
        if let Some(slot) = self.slots.read().await.get(id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, id: &BrokerId) -> Option<Slot> {
        self.slots.read().await.get(id).cloned()
    }

    /// Drop `slot` from the map if it is empty and only the map and the
    /// caller still reference it. Callers must not hold the slot's lock.
    async fn prune(&self, id: &BrokerId, slot: Slot) {
        let mut slots = self.slots.write().await;
        let Some(current) = slots.get(id) else {
            return;
        };
        if !Arc::ptr_eq(current, &slot) || Arc::strong_count(&slot) > 2 {
            return;
        }
        let empty = slot.try_lock().map(|entry| entry.is_none()).unwrap_or(false);
        if empty {
            slots.remove(id);
        }
    }

    /// Return the cached client for `id`, constructing it with `factory` if absent.
    pub async fn get_or_create<F, Fut>(
        &self,
        id: &BrokerId,
        factory: F,
    ) -> BrokerResult<Arc<dyn Broker>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<Arc<dyn Broker>>>,
    {
        let slot = self.slot(id).await;
        let built = {
            let mut entry = slot.lock().await;
            if let Some(existing) = entry.as_ref() {
                return Ok(existing.broker.clone());
            }
            factory().await.inspect(|broker| {
                *entry = Some(Entry::new(broker.clone()));
                info!(broker = %id, "broker client created");
            })
        };
        if built.is_err() {
            self.prune(id, slot).await;
        }
        built
    }

    /// Discard any existing client for `id` and construct a new one.
    ///
    /// The old entry is dropped before the factory runs; if the factory
    /// fails the identity is left without a client.
    pub async fn replace<F, Fut>(
        &self,
        id: &BrokerId,
        factory: F,
    ) -> BrokerResult<Arc<dyn Broker>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<Arc<dyn Broker>>>,
    {
        let slot = self.slot(id).await;
        let built = {
            let mut entry = slot.lock().await;
            if let Some(old) = entry.take() {
                debug!(broker = %id, age = ?old.created_at.elapsed(), "discarding broker client");
            }
            factory().await.inspect(|broker| {
                *entry = Some(Entry::new(broker.clone()));
                info!(broker = %id, "broker client replaced");
            })
        };
        if built.is_err() {
            self.prune(id, slot).await;
        }
        built
    }

    /// Evict the client for `id`. Returns true if one was present.
    pub async fn remove(&self, id: &BrokerId) -> bool {
        let Some(slot) = self.existing_slot(id).await else {
            return false;
        };
        let removed = slot.lock().await.take().is_some();
        if removed {
            info!(broker = %id, "broker client removed");
        }
        self.prune(id, slot).await;
        removed
    }

    /// Return the cached client for `id` without constructing one.
    pub async fn lookup(&self, id: &BrokerId) -> BrokerResult<Arc<dyn Broker>> {
        let slot = self
            .existing_slot(id)
            .await
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        let entry = slot.lock().await;
        entry
            .as_ref()
            .map(|e| e.broker.clone())
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    /// Count a connectivity failure. Returns true if the entry was evicted.
    pub async fn report_failure(&self, id: &BrokerId) -> bool {
        let Some(slot) = self.existing_slot(id).await else {
            return false;
        };
        {
            let mut entry = slot.lock().await;
            let Some(current) = entry.as_mut() else {
                return false;
            };
            current.consecutive_failures += 1;
            if current.consecutive_failures < self.failure_threshold {
                debug!(
                    broker = %id,
                    failures = current.consecutive_failures,
                    threshold = self.failure_threshold,
                    "broker failure recorded"
                );
                return false;
            }
            warn!(
                broker = %id,
                failures = current.consecutive_failures,
                "broker failing repeatedly, evicting client"
            );
            *entry = None;
        }
        self.prune(id, slot).await;
        true
    }

    /// Reset the failure count after a successful call.
    pub async fn report_success(&self, id: &BrokerId) {
        let Some(slot) = self.existing_slot(id).await else {
            return;
        };
        if let Some(current) = slot.lock().await.as_mut() {
            current.consecutive_failures = 0;
        }
    }

    /// Identities that currently hold a live client.
    pub async fn identities(&self) -> Vec<BrokerId> {
        let slots: Vec<(BrokerId, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut live = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.is_some() {
                live.push(id);
            }
        }
        live.sort();
        live
    }

    pub async fn len(&self) -> usize {
        self.identities().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn id(name: &str) -> BrokerId {
        BrokerId::new("default", name)
    }

    fn memory() -> Arc<dyn Broker> {
        Arc::new(MemoryBroker::new())
    }

    #[tokio::test]
    async fn concurrent_get_or_create_runs_factory_once() {
        let registry = Arc::new(BrokerRegistry::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_create(&id("redis"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(memory())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut clients = Vec::new();
        for h in handles {
            clients.push(h.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for c in &clients[1..] {
            assert!(Arc::ptr_eq(&clients[0], c));
        }
    }

    #[tokio::test]
    async fn failed_factory_leaves_no_entry() {
        let registry = BrokerRegistry::default();
        let err = registry
            .get_or_create(&id("redis"), || async {
                Err(BrokerError::Connection("refused".to_string()))
            })
            .await;
        assert!(err.is_err());
        assert!(matches!(
            registry.lookup(&id("redis")).await,
            Err(BrokerError::NotFound(_))
        ));

        // A later acquisition constructs afresh.
        registry
            .get_or_create(&id("redis"), || async { Ok(memory()) })
            .await
            .unwrap();
        assert!(registry.lookup(&id("redis")).await.is_ok());
    }

    #[tokio::test]
    async fn unrelated_identities_do_not_block_each_other() {
        let registry = Arc::new(BrokerRegistry::default());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .get_or_create(&id("slow"), || async move {
                        let _ = release_rx.await;
                        Ok(memory())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            registry.get_or_create(&id("fast"), || async { Ok(memory()) }),
        )
        .await;
        assert!(fast.is_ok(), "fast identity waited on slow construction");

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn replace_swaps_client() {
        let registry = BrokerRegistry::default();
        let first = registry
            .get_or_create(&id("redis"), || async { Ok(memory()) })
            .await
            .unwrap();
        let second = registry
            .replace(&id("redis"), || async { Ok(memory()) })
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        let current = registry.lookup(&id("redis")).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn failed_replace_drops_old_client() {
        let registry = BrokerRegistry::default();
        registry
            .get_or_create(&id("redis"), || async { Ok(memory()) })
            .await
            .unwrap();
        let result = registry
            .replace(&id("redis"), || async {
                Err(BrokerError::Connection("refused".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(registry.lookup(&id("redis")).await.is_err());
    }

    #[tokio::test]
    async fn remove_and_lookup() {
        let registry = BrokerRegistry::default();
        assert!(!registry.remove(&id("redis")).await);

        registry
            .get_or_create(&id("redis"), || async { Ok(memory()) })
            .await
            .unwrap();
        assert!(registry.remove(&id("redis")).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn repeated_failures_evict() {
        let registry = BrokerRegistry::new(2);
        registry
            .get_or_create(&id("redis"), || async { Ok(memory()) })
            .await
            .unwrap();

        assert!(!registry.report_failure(&id("redis")).await);
        registry.report_success(&id("redis")).await;
        assert!(!registry.report_failure(&id("redis")).await);
        assert!(registry.report_failure(&id("redis")).await);
        assert!(registry.lookup(&id("redis")).await.is_err());
    }

    #[tokio::test]
    async fn removed_identities_release_slots() {
        let registry = BrokerRegistry::default();
        for n in 0..1000 {
            let broker = id(&format!("redis-{n}"));
            registry
                .get_or_create(&broker, || async { Ok(memory()) })
                .await
                .unwrap();
            assert!(registry.remove(&broker).await);
        }
        assert_eq!(registry.slots.read().await.len(), 0);
    }

    #[tokio::test]
    async fn failures_and_evictions_release_slots() {
        let registry = BrokerRegistry::new(1);
        let _ = registry
            .get_or_create(&id("refused"), || async {
                Err(BrokerError::Connection("refused".to_string()))
            })
            .await;
        registry
            .get_or_create(&id("flaky"), || async { Ok(memory()) })
            .await
            .unwrap();
        assert!(registry.report_failure(&id("flaky")).await);

        assert_eq!(registry.slots.read().await.len(), 0);
    }
}
