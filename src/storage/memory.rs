//! In-memory storage backends for single-process development and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::contract::{TaskPatch, TaskRecord};
use crate::error::StorageError;
use crate::storage::{TaskStore, WorkerDirectory};

/// Process-local task store. No TTL eviction; records live until deleted.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, TaskRecord>>,
    /// When set, `create_task` fails as if the store were unreachable.
    pub fail_creates: std::sync::atomic::AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
        if self.fail_creates.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(StorageError::Unavailable {
                key: format!("task:{}", record.correlation_id),
            });
        }
        self.records
            .lock()
            .await
            .insert(record.correlation_id.clone(), record.clone());
        Ok(())
    }

    async fn get_task(&self, correlation_id: &str) -> Option<TaskRecord> {
        self.records.lock().await.get(correlation_id).cloned()
    }

    async fn update_task(&self, correlation_id: &str, patch: &TaskPatch) {
        let mut records = self.records.lock().await;
        let record = records
            .entry(correlation_id.to_string())
            .or_insert_with(|| TaskRecord::skeleton(correlation_id));
        patch.apply(record);
        record.updated_at = Utc::now();
    }

    async fn update_task_resilient(
        &self,
        correlation_id: &str,
        patch: &TaskPatch,
        _max_wait: Duration,
    ) -> bool {
        self.update_task(correlation_id, patch).await;
        true
    }

    async fn list_tasks(&self) -> Vec<TaskRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    async fn delete_task(&self, correlation_id: &str) -> bool {
        self.records.lock().await.remove(correlation_id).is_some()
    }
}

/// Fixed worker roster for gateway tests.
pub struct StaticWorkerDirectory(pub usize);

#[async_trait]
impl WorkerDirectory for StaticWorkerDirectory {
    async fn worker_count(&self) -> usize {
        self.0
    }

    async fn active_workers(&self) -> Vec<serde_json::Value> {
        (0..self.0)
            .map(|i| {
                serde_json::json!({
                    "worker_id": format!("worker-{i}"),
                    "status": "idle",
                    "updated_at": Utc::now().to_rfc3339(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::contract::TaskStatus;

    use super::*;

    #[tokio::test]
    async fn update_merges_and_bumps_updated_at() {
        let store = MemoryTaskStore::new();
        let record = TaskRecord::accepted("c-1", "u-1", "u@example.com", "mandate", 5);
        store.create_task(&record).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2)).await;
        store
            .update_task("c-1", &TaskPatch::status(TaskStatus::InProgress))
            .await;

        let loaded = store.get_task("c-1").await.unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.mandate.as_deref(), Some("mandate"));
        assert!(loaded.updated_at > record.updated_at);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryTaskStore::new();
        store
            .create_task(&TaskRecord::skeleton("c-2"))
            .await
            .unwrap();
        assert!(store.delete_task("c-2").await);
        assert!(!store.delete_task("c-2").await);
    }
}
