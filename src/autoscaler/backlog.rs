//! Backlog observation.
//!
//! The autoscaler can read queue depth straight from the broker or from a
//! mirror sample in the KV store written by the metrics process. The
//! mirror decouples scaling decisions from broker connectivity: a stale
//! or missing sample reads as "metric unavailable" and the decision layer
//! treats it as an empty backlog, loudly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::broker::BrokerConnector;
use crate::kv::KvConnector;

/// Samples older than this are discarded by the mirror reader.
pub const MAX_SAMPLE_AGE: Duration = Duration::from_secs(120);

/// TTL on mirror samples; slightly above the freshness window so the key
/// disappears shortly after it stops being useful.
const SAMPLE_TTL_SECONDS: u64 = 120;

#[async_trait]
pub trait BacklogSource: Send + Sync {
    /// Current backlog for a queue, `None` when the metric is unavailable.
    async fn backlog(&self, queue: &str) -> Option<u32>;
}

/// Live queue depth from the broker.
pub struct BrokerBacklog {
    broker: Arc<BrokerConnector>,
}

impl BrokerBacklog {
    pub fn new(broker: Arc<BrokerConnector>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BacklogSource for BrokerBacklog {
    async fn backlog(&self, queue: &str) -> Option<u32> {
        self.broker.get_queue_depth(queue).await
    }
}

fn sample_key(queue: &str) -> String {
    format!("metrics:queue_depth:{queue}")
}

/// Depth sample read from the KV mirror, rejecting anything older than
/// [`MAX_SAMPLE_AGE`].
pub struct MirrorBacklog {
    kv: Arc<KvConnector>,
}

impl MirrorBacklog {
    pub fn new(kv: Arc<KvConnector>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl BacklogSource for MirrorBacklog {
    async fn backlog(&self, queue: &str) -> Option<u32> {
        let sample = self.kv.get_json(&sample_key(queue)).await?;
        let depth = sample.get("depth").and_then(serde_json::Value::as_u64)? as u32;
        let ts = sample
            .get("ts")
            .and_then(serde_json::Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())?
            .with_timezone(&Utc);

        let age = Utc::now().signed_duration_since(ts);
        if age.num_seconds() < 0 || age.num_seconds() as u64 > MAX_SAMPLE_AGE.as_secs() {
            tracing::warn!(queue, age_s = age.num_seconds(), "backlog sample is stale");
            return None;
        }
        Some(depth)
    }
}

/// Periodically samples queue depth from the broker and mirrors it into
/// the KV store for [`MirrorBacklog`] readers. Run by the metrics binary.
pub struct DepthSampler {
    broker: Arc<BrokerConnector>,
    kv: Arc<KvConnector>,
    queues: Vec<String>,
    interval: Duration,
}

impl DepthSampler {
    pub fn new(
        broker: Arc<BrokerConnector>,
        kv: Arc<KvConnector>,
        queues: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            kv,
            queues,
            interval,
        }
    }

    /// Sample every queue once and mirror the depths that were readable.
    pub async fn sample_once(&self) {
        for queue in &self.queues {
            match self.broker.get_queue_depth(queue).await {
                Some(depth) => {
                    tracing::info!(queue = %queue, depth, "queue depth");
                    let sample = serde_json::json!({
                        "queue": queue,
                        "depth": depth,
                        "ts": Utc::now().to_rfc3339(),
                    });
                    if !self
                        .kv
                        .set_json(&sample_key(queue), &sample, Some(SAMPLE_TTL_SECONDS))
                        .await
                    {
                        tracing::debug!(queue = %queue, "could not mirror depth sample");
                    }
                }
                None => {
                    tracing::debug!(queue = %queue, "queue depth unavailable");
                }
            }
        }
    }

    /// Sample forever on the configured interval.
    pub async fn run(&self) {
        tracing::info!(
            queues = ?self.queues,
            interval_s = self.interval.as_secs(),
            "depth sampler started"
        );
        loop {
            self.sample_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_keys_are_per_queue() {
        assert_eq!(
            sample_key("agent.mandates"),
            "metrics:queue_depth:agent.mandates"
        );
    }

    #[tokio::test]
    async fn mirror_returns_none_without_kv() {
        let kv = Arc::new(KvConnector::new(None, Duration::ZERO));
        let mirror = MirrorBacklog::new(kv);
        assert_eq!(mirror.backlog("agent.mandates").await, None);
    }
}
