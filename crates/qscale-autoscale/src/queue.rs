//! Deduplicating work queue with per-key exclusion.
//!
//! A key is queued at most once. While a worker holds a key it is never
//! handed to a second worker; re-enqueueing it in that window marks it dirty
//! and it is queued again when the holder calls [`WorkQueue::done`]. Many
//! triggers for one key therefore collapse into at most one running and one
//! pending pass.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use tokio::sync::{Mutex, Notify};

struct Inner<K> {
    order: VecDeque<K>,
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    dirty: HashSet<K>,
    closed: bool,
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                dirty: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue `key`. Returns false if it was already pending or the queue is closed.
    pub async fn enqueue(&self, key: K) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.queued.contains(&key) {
            return false;
        }
        if inner.in_flight.contains(&key) {
            return inner.dirty.insert(key);
        }
        inner.queued.insert(key.clone());
        inner.order.push_back(key);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Wait for the next key. `None` once the queue is closed.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return None;
                }
                if let Some(key) = Self::pop(&mut inner) {
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Take the next key without waiting.
    pub async fn try_next(&self) -> Option<K> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        Self::pop(&mut inner)
    }

    fn pop(inner: &mut Inner<K>) -> Option<K> {
        let key = inner.order.pop_front()?;
        inner.queued.remove(&key);
        inner.in_flight.insert(key.clone());
        Some(key)
    }

    /// Release `key`. Requeues it if it was triggered while held.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(key);
        if inner.dirty.remove(key) && !inner.closed {
            inner.queued.insert(key.clone());
            inner.order.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiter.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
