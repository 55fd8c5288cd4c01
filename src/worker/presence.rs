//! Worker presence loop.
//!
//! Refreshes the registry entries every status period so the worker stays
//! visible exactly as long as it keeps breathing; the TTL is three periods,
//! so two missed refreshes survive a hiccup and a third evicts the worker.
//! Degrades gracefully when the KV store is unavailable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::storage::{WorkerRegistry, WorkerStatus};

pub struct WorkerPresence {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    interval: Duration,
    activity: watch::Receiver<WorkerStatus>,
}

impl WorkerPresence {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        worker_id: impl Into<String>,
        interval: Duration,
        activity: watch::Receiver<WorkerStatus>,
    ) -> Self {
        Self {
            registry,
            worker_id: worker_id.into(),
            interval,
            activity,
        }
    }

    /// Run until the shutdown signal flips, then publish a final
    /// `shutdown` status and withdraw from the registry.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.worker_id,
            interval_s = self.interval.as_secs(),
            "presence loop started"
        );

        loop {
            let status = *self.activity.borrow();
            if !self.registry.publish_status(&self.worker_id, status).await {
                tracing::debug!(worker_id = %self.worker_id, "presence refresh failed");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        // Last writes: advertise shutdown, then withdraw the keys.
        self.registry
            .publish_status(&self.worker_id, WorkerStatus::Shutdown)
            .await;
        self.registry.remove(&self.worker_id).await;
        tracing::info!(worker_id = %self.worker_id, "presence withdrawn");
    }
}
