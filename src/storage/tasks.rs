//! Redis-backed task records.
//!
//! Keys are `task:{correlation_id}` with a 10-minute TTL that refreshes on
//! every update, so abandoned records evict themselves without a sweeper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use crate::contract::{TaskPatch, TaskRecord};
use crate::error::StorageError;
use crate::kv::{KvConnector, scan_keys};
use crate::storage::TaskStore;

pub const TASK_TTL_SECONDS: u64 = 600;

const KEY_PREFIX: &str = "task:";
const SCAN_PAGE: usize = 100;

pub struct RedisTaskStorage {
    kv: Arc<KvConnector>,
}

impl RedisTaskStorage {
    pub fn new(kv: Arc<KvConnector>) -> Self {
        Self { kv }
    }

    fn key(correlation_id: &str) -> String {
        format!("{KEY_PREFIX}{correlation_id}")
    }

    fn parse(correlation_id: &str, value: serde_json::Value) -> TaskRecord {
        match serde_json::from_value(value) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    correlation_id,
                    error = %err,
                    "task record did not parse, rebuilding skeleton"
                );
                TaskRecord::skeleton(correlation_id)
            }
        }
    }
}

#[async_trait]
impl TaskStore for RedisTaskStorage {
    async fn create_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        let key = Self::key(&record.correlation_id);
        let value = serde_json::to_value(record).expect("task record serializes");
        tracing::debug!(
            correlation_id = %record.correlation_id,
            ttl_s = TASK_TTL_SECONDS,
            "storing task record"
        );
        if self.kv.set_json(&key, &value, Some(TASK_TTL_SECONDS)).await {
            Ok(())
        } else {
            tracing::error!(correlation_id = %record.correlation_id, "task record write not confirmed");
            Err(StorageError::Unavailable { key })
        }
    }

    async fn get_task(&self, correlation_id: &str) -> Option<TaskRecord> {
        let value = self.kv.get_json(&Self::key(correlation_id)).await?;
        Some(Self::parse(correlation_id, value))
    }

    async fn update_task(&self, correlation_id: &str, patch: &TaskPatch) {
        let key = Self::key(correlation_id);
        let mut record = match self.kv.get_json(&key).await {
            Some(value) => Self::parse(correlation_id, value),
            None => TaskRecord::skeleton(correlation_id),
        };
        patch.apply(&mut record);
        record.updated_at = Utc::now();
        let value = serde_json::to_value(&record).expect("task record serializes");
        self.kv.set_json(&key, &value, Some(TASK_TTL_SECONDS)).await;
        tracing::debug!(correlation_id, "task record updated");
    }

    async fn update_task_resilient(
        &self,
        correlation_id: &str,
        patch: &TaskPatch,
        max_wait: Duration,
    ) -> bool {
        let key = Self::key(correlation_id);
        // The read gets a smaller budget; if the record is gone the patch
        // still carries the full intended state.
        let read_wait = Duration::from_secs(30).min(max_wait);
        let mut record = match self.kv.get_json_resilient(&key, read_wait).await {
            Some(value) => Self::parse(correlation_id, value),
            None => TaskRecord::skeleton(correlation_id),
        };
        patch.apply(&mut record);
        record.updated_at = Utc::now();
        let value = serde_json::to_value(&record).expect("task record serializes");
        self.kv
            .set_json_resilient(&key, &value, Some(TASK_TTL_SECONDS), max_wait)
            .await
    }

    async fn list_tasks(&self) -> Vec<TaskRecord> {
        let Some(mut conn) = self.kv.client().await else {
            return Vec::new();
        };
        let keys = match scan_keys(&mut conn, &format!("{KEY_PREFIX}*"), SCAN_PAGE).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::error!(error = %err, "task scan failed");
                return Vec::new();
            }
        };
        if keys.is_empty() {
            return Vec::new();
        }

        let values: redis::RedisResult<Vec<Option<String>>> = conn.mget(&keys).await;
        match values {
            Ok(values) => keys
                .iter()
                .zip(values)
                .filter_map(|(key, value)| {
                    let raw = value?;
                    let correlation_id = key.strip_prefix(KEY_PREFIX).unwrap_or(key);
                    let parsed = serde_json::from_str(&raw)
                        .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
                    Some(Self::parse(correlation_id, parsed))
                })
                .collect(),
            Err(err) => {
                tracing::error!(error = %err, "task mget failed");
                Vec::new()
            }
        }
    }

    async fn delete_task(&self, correlation_id: &str) -> bool {
        let Some(mut conn) = self.kv.client().await else {
            return false;
        };
        let deleted: redis::RedisResult<i64> = conn.del(Self::key(correlation_id)).await;
        match deleted {
            Ok(n) if n > 0 => {
                tracing::info!(correlation_id, "task record deleted");
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::error!(correlation_id, error = %err, "task delete failed");
                false
            }
        }
    }
}
