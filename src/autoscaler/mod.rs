//! Worker-pool autoscaling.
//!
//! A stateless, periodic decision: read backlog depth and the protected
//! worker count, compute the desired pool size by the ceiling rule, clamp
//! into `[MIN_WORKERS, MAX_WORKERS]`, and push it to the orchestration
//! API. The pool never shrinks below the number of workers that are
//! mid-task; their protection keys decay on their own if a worker dies.

pub mod backlog;
pub mod pool;

pub use backlog::{BacklogSource, BrokerBacklog, DepthSampler, MirrorBacklog};
pub use pool::{HttpWorkerPool, WorkerPool};

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::kv::{KvConnector, scan_keys};
use crate::settings::{Settings, WORKER_TYPE};
use crate::storage::WorkerStatus;
use crate::worker::is_protected;

/// Scaling bounds and target.
#[derive(Debug, Clone, Copy)]
pub struct ScaleLimits {
    pub min_workers: u32,
    pub max_workers: u32,
    pub target_messages_per_worker: u32,
}

impl ScaleLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_workers: settings.min_workers,
            max_workers: settings.max_workers,
            target_messages_per_worker: settings.target_messages_per_worker,
        }
    }
}

/// Desired pool size for a backlog: the floor when the queue is empty,
/// otherwise `ceil(backlog / target)` clamped into the bounds.
pub fn calculate_desired(backlog: u32, limits: &ScaleLimits) -> u32 {
    if backlog == 0 {
        return limits.min_workers;
    }
    backlog
        .div_ceil(limits.target_messages_per_worker.max(1))
        .clamp(limits.min_workers, limits.max_workers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Desired already matches current.
    NoChange,
    ScaleOut,
    ScaleIn,
    /// The orchestrator could not be read or written; no action taken.
    Skipped,
}

impl std::fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScaleAction::NoChange => "none",
            ScaleAction::ScaleOut => "scale_out",
            ScaleAction::ScaleIn => "scale_in",
            ScaleAction::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// What one invocation observed and did.
#[derive(Debug, Clone, Copy)]
pub struct ScaleOutcome {
    pub action: ScaleAction,
    pub backlog: u32,
    pub protected: u32,
    pub current: Option<u32>,
    pub desired: Option<u32>,
}

/// Count of workers whose advisory state protects them from scale-in.
#[async_trait]
pub trait ProtectionView: Send + Sync {
    async fn protected_count(&self) -> u32;
}

/// Reads `{prefix}:agent:*` state documents from the KV store.
pub struct KvProtection {
    kv: Arc<KvConnector>,
    prefix: String,
}

impl KvProtection {
    pub fn new(kv: Arc<KvConnector>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ProtectionView for KvProtection {
    async fn protected_count(&self) -> u32 {
        let Some(mut conn) = self.kv.client().await else {
            tracing::warn!("kv unavailable, protected count treated as 0");
            return 0;
        };
        let pattern = format!("{}:{WORKER_TYPE}:*", self.prefix);
        let keys = match scan_keys(&mut conn, &pattern, 200).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "failed to scan worker states");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        let values: redis::RedisResult<Vec<Option<String>>> = conn.mget(&keys).await;
        let values = match values {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read worker states");
                return 0;
            }
        };

        values
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .filter_map(|doc| {
                serde_json::from_value::<WorkerStatus>(doc.get("state")?.clone()).ok()
            })
            .filter(|state| is_protected(*state))
            .count() as u32
    }
}

/// The periodic control loop, pure over its three observations.
pub struct Autoscaler {
    queue: String,
    limits: ScaleLimits,
    backlog: Arc<dyn BacklogSource>,
    protection: Arc<dyn ProtectionView>,
    pool: Arc<dyn WorkerPool>,
}

impl Autoscaler {
    pub fn new(
        queue: impl Into<String>,
        limits: ScaleLimits,
        backlog: Arc<dyn BacklogSource>,
        protection: Arc<dyn ProtectionView>,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        Self {
            queue: queue.into(),
            limits,
            backlog,
            protection,
            pool,
        }
    }

    /// One scaling decision. Observes, computes, acts; never scales in
    /// below `max(MIN_WORKERS, protected)`.
    pub async fn run_once(&self) -> ScaleOutcome {
        let backlog = match self.backlog.backlog(&self.queue).await {
            Some(depth) => depth,
            None => {
                tracing::error!(
                    queue = %self.queue,
                    "backlog metric unavailable, treating depth as 0"
                );
                0
            }
        };

        let protected = self.protection.protected_count().await;

        let current = match self.pool.desired_count().await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!(error = %err, "could not read current desired count");
                return ScaleOutcome {
                    action: ScaleAction::Skipped,
                    backlog,
                    protected,
                    current: None,
                    desired: None,
                };
            }
        };

        let mut desired = calculate_desired(backlog, &self.limits);
        if protected > desired {
            desired = protected;
        }

        if desired == current {
            tracing::info!(
                current,
                backlog,
                protected,
                "no scaling needed"
            );
            return ScaleOutcome {
                action: ScaleAction::NoChange,
                backlog,
                protected,
                current: Some(current),
                desired: Some(desired),
            };
        }

        let action = if desired < current {
            ScaleAction::ScaleIn
        } else {
            ScaleAction::ScaleOut
        };
        if let Err(err) = self.pool.set_desired_count(desired).await {
            tracing::error!(error = %err, desired, "failed to update desired count");
            return ScaleOutcome {
                action: ScaleAction::Skipped,
                backlog,
                protected,
                current: Some(current),
                desired: Some(desired),
            };
        }

        tracing::info!(
            action = %action,
            current,
            desired,
            backlog,
            protected,
            "pool resized"
        );
        ScaleOutcome {
            action,
            backlog,
            protected,
            current: Some(current),
            desired: Some(desired),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::PoolError;

    use super::*;

    fn limits() -> ScaleLimits {
        ScaleLimits {
            min_workers: 1,
            max_workers: 11,
            target_messages_per_worker: 2,
        }
    }

    #[test]
    fn empty_backlog_forces_floor() {
        assert_eq!(calculate_desired(0, &limits()), 1);
    }

    #[test]
    fn one_target_batch_needs_one_worker() {
        assert_eq!(calculate_desired(2, &limits()), 1);
        assert_eq!(calculate_desired(1, &limits()), 1);
    }

    #[test]
    fn ceiling_rule_rounds_up() {
        assert_eq!(calculate_desired(3, &limits()), 2);
        assert_eq!(calculate_desired(10, &limits()), 5);
    }

    #[test]
    fn enormous_backlog_clamps_to_ceiling() {
        assert_eq!(calculate_desired(1_000_000_000, &limits()), 11);
    }

    struct FixedBacklog(Option<u32>);

    #[async_trait]
    impl BacklogSource for FixedBacklog {
        async fn backlog(&self, _queue: &str) -> Option<u32> {
            self.0
        }
    }

    struct FixedProtection(u32);

    #[async_trait]
    impl ProtectionView for FixedProtection {
        async fn protected_count(&self) -> u32 {
            self.0
        }
    }

    struct FakePool {
        desired: AtomicU32,
        reachable: bool,
    }

    impl FakePool {
        fn new(desired: u32) -> Arc<Self> {
            Arc::new(Self {
                desired: AtomicU32::new(desired),
                reachable: true,
            })
        }
    }

    #[async_trait]
    impl WorkerPool for FakePool {
        async fn desired_count(&self) -> Result<u32, PoolError> {
            if !self.reachable {
                return Err(PoolError::Unavailable("down".to_string()));
            }
            Ok(self.desired.load(Ordering::SeqCst))
        }

        async fn set_desired_count(&self, desired: u32) -> Result<(), PoolError> {
            self.desired.store(desired, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scaler(
        backlog: Option<u32>,
        protected: u32,
        pool: Arc<FakePool>,
    ) -> Autoscaler {
        Autoscaler::new(
            "agent.mandates",
            limits(),
            Arc::new(FixedBacklog(backlog)),
            Arc::new(FixedProtection(protected)),
            pool,
        )
    }

    #[tokio::test]
    async fn scale_out_follows_ceiling_and_protection() {
        // Backlog 10, protected 2, current 1 -> desired max(ceil(10/2), 2) = 5.
        let pool = FakePool::new(1);
        let outcome = scaler(Some(10), 2, pool.clone()).run_once().await;
        assert_eq!(outcome.action, ScaleAction::ScaleOut);
        assert_eq!(outcome.desired, Some(5));
        assert_eq!(pool.desired.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn scale_in_floors_at_protected() {
        // Backlog 0, protected 3, current 5 -> desired max(1, 3) = 3.
        let pool = FakePool::new(5);
        let outcome = scaler(Some(0), 3, pool.clone()).run_once().await;
        assert_eq!(outcome.action, ScaleAction::ScaleIn);
        assert_eq!(outcome.desired, Some(3));
        assert_eq!(pool.desired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_metric_counts_as_empty_backlog() {
        let pool = FakePool::new(4);
        let outcome = scaler(None, 0, pool.clone()).run_once().await;
        assert_eq!(outcome.backlog, 0);
        assert_eq!(outcome.action, ScaleAction::ScaleIn);
        assert_eq!(pool.desired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn matching_desired_is_a_no_op() {
        let pool = FakePool::new(5);
        let outcome = scaler(Some(10), 0, pool.clone()).run_once().await;
        assert_eq!(outcome.action, ScaleAction::NoChange);
        assert_eq!(pool.desired.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn unreachable_orchestrator_takes_no_action() {
        let pool = Arc::new(FakePool {
            desired: AtomicU32::new(2),
            reachable: false,
        });
        let outcome = scaler(Some(10), 0, pool.clone()).run_once().await;
        assert_eq!(outcome.action, ScaleAction::Skipped);
        assert_eq!(pool.desired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invocation_lands_inside_safety_bounds() {
        // Property: desired stays in [max(min, protected), max].
        for (backlog, protected, current) in
            [(0, 0, 1), (5, 2, 1), (100, 4, 11), (0, 7, 9), (3, 0, 2)]
        {
            let pool = FakePool::new(current);
            let outcome = scaler(Some(backlog), protected, pool).run_once().await;
            if let Some(desired) = outcome.desired {
                assert!(desired >= limits().min_workers.max(protected));
                assert!(desired <= limits().max_workers.max(protected));
            }
        }
    }
}
