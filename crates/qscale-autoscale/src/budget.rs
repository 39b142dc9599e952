//! Per-pass deadline and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ReconcileError;

/// Bounds every I/O call of a pass by one deadline and a shutdown signal.
pub struct PassBudget {
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl PassBudget {
    pub fn new(timeout: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Await `fut` unless the pass is cancelled or out of time first.
    pub async fn run<T, F>(&mut self, op: &'static str, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = T>,
    {
        if *self.cancel.borrow() {
            return Err(ReconcileError::Cancelled);
        }
        let deadline = self.deadline;
        let cancel = &mut self.cancel;
        tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(ReconcileError::Cancelled),
            res = tokio::time::timeout_at(deadline, fut) => {
                res.map_err(|_| ReconcileError::DeadlineExceeded(op))
            }
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}
