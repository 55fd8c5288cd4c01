//! Domain storage over the KV connector: task records under `task:{id}`
//! and the worker presence registry under `workers:agent` /
//! `worker:status:{id}`.
//!
//! The trait seams exist so the gateway can be exercised against
//! in-memory backends; production wires the Redis-backed implementations.

mod memory;
mod tasks;
mod workers;

pub use memory::{MemoryTaskStore, StaticWorkerDirectory};
pub use tasks::{RedisTaskStorage, TASK_TTL_SECONDS};
pub use workers::{WorkerRegistry, WorkerStatus};

use std::time::Duration;

use async_trait::async_trait;

use crate::contract::{TaskPatch, TaskRecord};
use crate::error::StorageError;

/// Task-record operations keyed by correlation id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a fresh record. Raises when the store did not confirm the
    /// write; callers must not proceed as if the task existed.
    async fn create_task(&self, record: &TaskRecord) -> Result<(), StorageError>;

    /// Load a record, `None` on miss.
    async fn get_task(&self, correlation_id: &str) -> Option<TaskRecord>;

    /// Read-modify-write merge of a patch, bumping `updated_at` and
    /// refreshing the TTL.
    async fn update_task(&self, correlation_id: &str, patch: &TaskPatch);

    /// Merge a patch using resilient reads and writes; used for every
    /// status transition published from a worker.
    async fn update_task_resilient(
        &self,
        correlation_id: &str,
        patch: &TaskPatch,
        max_wait: Duration,
    ) -> bool;

    /// All live task records.
    async fn list_tasks(&self) -> Vec<TaskRecord>;

    /// Delete a record; true when something was removed.
    async fn delete_task(&self, correlation_id: &str) -> bool;
}

/// Read side of the worker presence registry.
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    /// Count of live workers, sweeping stale registry entries as a side
    /// effect of the read.
    async fn worker_count(&self) -> usize;

    /// Status documents of every live worker, sweeping stale registry
    /// entries the same way the count does.
    async fn active_workers(&self) -> Vec<serde_json::Value>;
}
