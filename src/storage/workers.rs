//! Worker presence registry.
//!
//! Three related keys per worker, all sustained by the presence loop:
//! membership in the `workers:agent` set, an expiring existence key
//! `worker:agent:{id}`, and a status document `worker:status:{id}`. A
//! worker is alive iff its status key still exists; stale set members are
//! swept whenever the registry is read, so no background sweeper runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kv::KvConnector;
use crate::settings::WORKER_TYPE;
use crate::storage::WorkerDirectory;

/// Advertised worker activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Waiting,
    Shutdown,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

pub struct WorkerRegistry {
    kv: Arc<KvConnector>,
    ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(kv: Arc<KvConnector>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn set_key() -> String {
        format!("workers:{WORKER_TYPE}")
    }

    fn presence_key(worker_id: &str) -> String {
        format!("worker:{WORKER_TYPE}:{worker_id}")
    }

    fn status_key(worker_id: &str) -> String {
        format!("worker:status:{worker_id}")
    }

    /// Refresh a worker's registry entries: set membership, existence key,
    /// and status document, all on the registry TTL.
    pub async fn publish_status(&self, worker_id: &str, status: WorkerStatus) -> bool {
        let Some(mut conn) = self.kv.client().await else {
            return false;
        };
        let ttl = self.ttl.as_secs().max(1);

        let added: redis::RedisResult<i64> = conn.sadd(Self::set_key(), worker_id).await;
        if let Err(err) = added {
            tracing::debug!(worker_id, error = %err, "presence set update failed");
            return false;
        }
        let presence: redis::RedisResult<()> =
            conn.set_ex(Self::presence_key(worker_id), "1", ttl).await;
        if let Err(err) = presence {
            tracing::debug!(worker_id, error = %err, "presence key update failed");
            return false;
        }

        let document = serde_json::json!({
            "worker_id": worker_id,
            "status": status,
            "updated_at": Utc::now().to_rfc3339(),
        });
        self.kv
            .set_json(&Self::status_key(worker_id), &document, Some(ttl))
            .await
    }

    async fn sweep(&self, conn: &mut redis::aio::MultiplexedConnection, stale: Vec<String>) {
        if stale.is_empty() {
            return;
        }
        tracing::debug!(count = stale.len(), "sweeping stale workers from registry");
        for worker_id in stale {
            let removed: redis::RedisResult<i64> = conn.srem(Self::set_key(), &worker_id).await;
            if let Err(err) = removed {
                tracing::debug!(worker_id, error = %err, "stale member removal failed");
                continue;
            }
            let _: redis::RedisResult<i64> = conn.del(Self::presence_key(&worker_id)).await;
            let _: redis::RedisResult<i64> = conn.del(Self::status_key(&worker_id)).await;
        }
    }

    /// Drop a worker's registry entries on clean shutdown.
    pub async fn remove(&self, worker_id: &str) {
        let Some(mut conn) = self.kv.client().await else {
            return;
        };
        let _: redis::RedisResult<i64> = conn.del(Self::presence_key(worker_id)).await;
        let _: redis::RedisResult<i64> = conn.del(Self::status_key(worker_id)).await;
        let _: redis::RedisResult<i64> = conn.srem(Self::set_key(), worker_id).await;
        tracing::info!(worker_id, "worker removed from registry");
    }
}

#[async_trait]
impl WorkerDirectory for WorkerRegistry {
    async fn worker_count(&self) -> usize {
        let Some(mut conn) = self.kv.client().await else {
            tracing::debug!("kv unavailable for worker count");
            return 0;
        };
        let members: Vec<String> = match conn.smembers(Self::set_key()).await {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read worker set");
                return 0;
            }
        };
        if members.is_empty() {
            return 0;
        }

        let mut alive = 0usize;
        let mut stale = Vec::new();
        for worker_id in members {
            let exists: redis::RedisResult<bool> =
                conn.exists(Self::status_key(&worker_id)).await;
            match exists {
                Ok(true) => alive += 1,
                Ok(false) => stale.push(worker_id),
                Err(err) => {
                    tracing::debug!(worker_id, error = %err, "worker liveness check failed");
                }
            }
        }
        self.sweep(&mut conn, stale).await;
        alive
    }

    /// Status documents of every live worker, sweeping stale set members.
    async fn active_workers(&self) -> Vec<Value> {
        let Some(mut conn) = self.kv.client().await else {
            return Vec::new();
        };
        let members: Vec<String> = match conn.smembers(Self::set_key()).await {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read worker set");
                return Vec::new();
            }
        };

        let mut workers = Vec::new();
        let mut stale = Vec::new();
        for worker_id in members {
            match self.kv.get_json(&Self::status_key(&worker_id)).await {
                Some(document) => workers.push(document),
                None => stale.push(worker_id),
            }
        }
        self.sweep(&mut conn, stale).await;
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(WorkerStatus::Working).unwrap(),
            serde_json::json!("working")
        );
        assert_eq!(WorkerStatus::Shutdown.to_string(), "shutdown");
    }

    #[test]
    fn keys_follow_registry_layout() {
        assert_eq!(WorkerRegistry::set_key(), "workers:agent");
        assert_eq!(WorkerRegistry::presence_key("h:1"), "worker:agent:h:1");
        assert_eq!(WorkerRegistry::status_key("h:1"), "worker:status:h:1");
    }
}
