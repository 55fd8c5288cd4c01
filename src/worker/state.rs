//! Scale-in protection state.
//!
//! Workers advertise their activity under `{prefix}:agent:{worker_id}`
//! with a short TTL; the autoscaler counts `working` and `waiting` entries
//! as protected and never shrinks the pool below them. Last-writer-wins,
//! and a crashed worker's protection simply decays.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;

use crate::kv::KvConnector;
use crate::settings::WORKER_TYPE;
use crate::storage::WorkerStatus;

/// States that exclude a worker from scale-in.
pub fn is_protected(status: WorkerStatus) -> bool {
    matches!(status, WorkerStatus::Working | WorkerStatus::Waiting)
}

pub struct WorkerStateStore {
    kv: Arc<KvConnector>,
    key: String,
}

impl WorkerStateStore {
    pub fn new(kv: Arc<KvConnector>, prefix: &str, worker_id: &str) -> Self {
        Self {
            kv,
            key: format!("{prefix}:{WORKER_TYPE}:{worker_id}"),
        }
    }

    /// Write the current state with a TTL. Returns false when the store
    /// did not confirm; callers treat that as a transient miss.
    pub async fn set_state(&self, status: WorkerStatus, ttl: Duration) -> bool {
        let payload = serde_json::json!({
            "state": status,
            "ts": Utc::now().to_rfc3339(),
        });
        let ok = self
            .kv
            .set_json(&self.key, &payload, Some(ttl.as_secs().max(1)))
            .await;
        if !ok {
            tracing::debug!(key = %self.key, %status, "failed to set worker state");
        }
        ok
    }

    /// Remove the state key on clean shutdown.
    pub async fn delete_state(&self) {
        let Some(mut conn) = self.kv.client().await else {
            return;
        };
        let deleted: redis::RedisResult<i64> = conn.del(&self.key).await;
        if let Err(err) = deleted {
            tracing::debug!(key = %self.key, error = %err, "failed to delete worker state");
        }
    }
}
