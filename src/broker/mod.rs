//! Message-broker connector.
//!
//! Wraps one AMQP connection and channel behind durable-queue publish and
//! consume operations. The channel moves `UNINIT -> READY <-> DIRTY`; any
//! I/O fault marks it dirty and the next operation reconnects through
//! `try_init`. Deliveries are acknowledged per message: success acks,
//! handler failure nacks with requeue, malformed payloads are acked and
//! discarded so they cannot poison the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::contract::{StatusEnvelope, TaskMessage};
use crate::error::{BrokerError, is_dns_failure};
use crate::retry::{Deadline, RetryConfig, resilient_write_delay};
use crate::settings::{Settings, redact_url};

/// Consumer callback for one decoded message. An `Err` nacks the delivery
/// back onto the queue; `Ok` acknowledges it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct AmqpHandle {
    connection: Connection,
    channel: Channel,
}

pub struct BrokerConnector {
    url: Option<String>,
    pub input_queue: String,
    pub status_queue: String,
    connect_schedule: RetryConfig,
    state: Mutex<Option<AmqpHandle>>,
    ready: AtomicBool,
}

impl BrokerConnector {
    pub fn new(
        url: Option<String>,
        input_queue: impl Into<String>,
        status_queue: impl Into<String>,
        jitter: Duration,
    ) -> Self {
        Self {
            url,
            input_queue: input_queue.into(),
            status_queue: status_queue.into(),
            connect_schedule: RetryConfig::connect_schedule(jitter),
            state: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.rabbitmq_url.clone(),
            settings.input_queue.clone(),
            settings.status_queue.clone(),
            settings.jitter,
        )
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Explicit connect for process startup: bounded to 10 attempts on the
    /// shared connection schedule.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        if self.url.is_none() {
            return Err(BrokerError::Unconfigured);
        }
        let ok = self
            .connect_schedule
            .clone()
            .bounded(10)
            .run_until("broker_connect", |_| self.try_init())
            .await;
        if ok { Ok(()) } else { Err(BrokerError::NotConnected) }
    }

    pub async fn disconnect(&self) {
        let handle = self.state.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.connection.close(0, "shutdown").await {
                tracing::debug!(error = %err, "broker close reported an error");
            }
        }
        self.ready.store(false, Ordering::Relaxed);
        tracing::info!("broker disconnected");
    }

    /// Single connection attempt: open connection and channel, declare the
    /// input queue durable, mark ready.
    async fn try_init(&self) -> bool {
        let Some(url) = &self.url else {
            tracing::warn!("broker URL not set");
            return false;
        };
        tracing::info!(url = %redact_url(url), "attempting broker connect");

        let connection = match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(connection) => connection,
            Err(err) => {
                log_connect_failure(&err);
                return false;
            }
        };
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                log_connect_failure(&err);
                return false;
            }
        };
        if let Err(err) = declare_durable(&channel, &self.input_queue).await {
            log_connect_failure(&err);
            return false;
        }

        *self.state.lock().await = Some(AmqpHandle {
            connection,
            channel,
        });
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!(input_queue = %self.input_queue, "broker connected");
        true
    }

    /// Idempotent readiness: ping a ready channel with a passive declare,
    /// otherwise reconnect on the connection schedule. Blocks until the
    /// broker is back; returns `false` only when no URL is configured.
    pub async fn init(&self) -> bool {
        if self.url.is_none() {
            tracing::warn!("broker URL not set");
            return false;
        }
        if self.verify().await {
            return true;
        }
        self.connect_schedule
            .run_until("broker_init", |_| self.try_init())
            .await
    }

    /// One-shot readiness for attempt-bounded operations: verify, or make
    /// a single reconnect attempt.
    async fn init_once(&self) -> bool {
        if self.verify().await {
            return true;
        }
        self.try_init().await
    }

    async fn verify(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        let channel = match self.channel().await {
            Some(channel) => channel,
            None => return false,
        };
        let ping = channel
            .queue_declare(
                &self.input_queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        match ping {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(error = %err, "channel check failed, reconnecting");
                self.handle_connection_loss().await;
                false
            }
        }
    }

    async fn channel(&self) -> Option<Channel> {
        self.state.lock().await.as_ref().map(|h| h.channel.clone())
    }

    /// Close quietly and mark the channel dirty.
    async fn handle_connection_loss(&self) {
        tracing::warn!("broker connection lost, cleaning up");
        let handle = self.state.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.connection.close(0, "connection loss cleanup").await;
        }
        self.ready.store(false, Ordering::Relaxed);
    }

    /// Broker-reported message count for a queue, or `None` on any channel
    /// fault. A `None` marks the channel dirty so the next call reconnects.
    pub async fn get_queue_depth(&self, queue: &str) -> Option<u32> {
        if !self.init_once().await {
            tracing::warn!(queue, "queue depth check failed: broker not ready");
            return None;
        }
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        match declared {
            Ok(state) => {
                let depth = state.message_count();
                tracing::debug!(queue, depth, "queue depth retrieved");
                Some(depth)
            }
            Err(err) => {
                tracing::warn!(queue, error = %err, "queue depth check failed");
                self.handle_connection_loss().await;
                None
            }
        }
    }

    /// Publish a persistent JSON message to the default exchange with the
    /// given correlation id. Retries 10 attempts when `resilient`, 3
    /// otherwise, backing off linearly between attempts.
    pub async fn publish_message(
        &self,
        queue: &str,
        payload: &Value,
        correlation_id: Option<&str>,
        resilient: bool,
    ) -> Result<(), BrokerError> {
        let max_attempts: u32 = if resilient { 10 } else { 3 };
        let step = Duration::from_secs(if resilient { 5 } else { 2 });

        for attempt in 1..=max_attempts {
            match self.publish_once(queue, payload, correlation_id).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        queue,
                        attempt,
                        correlation_id = correlation_id.unwrap_or(""),
                        error = %err,
                        "publish attempt failed"
                    );
                    self.handle_connection_loss().await;
                    if attempt < max_attempts {
                        tokio::time::sleep(step * attempt).await;
                    }
                }
            }
        }
        Err(BrokerError::PublishExhausted {
            queue: queue.to_string(),
            attempts: max_attempts,
        })
    }

    /// Publish with a wall-clock budget instead of an attempt budget,
    /// surviving broker loss for up to `max_wait`. Returns true on success.
    pub async fn publish_message_resilient(
        &self,
        queue: &str,
        payload: &Value,
        correlation_id: Option<&str>,
        max_wait: Duration,
    ) -> bool {
        let deadline = Deadline::new(max_wait);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.publish_once(queue, payload, correlation_id).await {
                Ok(()) => {
                    tracing::info!(
                        queue,
                        attempt,
                        correlation_id = correlation_id.unwrap_or(""),
                        "resilient publish succeeded"
                    );
                    return true;
                }
                Err(err) => {
                    if attempt == 1 || attempt.is_multiple_of(10) {
                        tracing::debug!(
                            queue,
                            attempt,
                            elapsed_s = deadline.elapsed().as_secs(),
                            error = %err,
                            "resilient publish attempt failed"
                        );
                    }
                    self.handle_connection_loss().await;
                }
            }
            if !deadline.sleep(resilient_write_delay(attempt)).await {
                tracing::warn!(
                    queue,
                    elapsed_s = deadline.elapsed().as_secs(),
                    "resilient publish timed out"
                );
                return false;
            }
        }
    }

    async fn publish_once(
        &self,
        queue: &str,
        payload: &Value,
        correlation_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        if !self.init_once().await {
            return Err(BrokerError::NotConnected);
        }
        let channel = self.channel().await.ok_or(BrokerError::NotConnected)?;

        // The destination queue may differ from the input queue declared at
        // init; make sure it exists before publishing into it.
        if let Err(err) = declare_durable(&channel, queue).await {
            return Err(BrokerError::Amqp(err));
        }

        let body = serde_json::to_vec(payload)?;
        tracing::debug!(
            queue,
            correlation_id = correlation_id.unwrap_or(""),
            size = body.len(),
            "publishing message"
        );

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        let confirm = channel
            .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
            .await?;
        confirm.await?;
        Ok(())
    }

    /// Publish a task message to the input queue.
    pub async fn publish_task(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        let payload = serde_json::to_value(message)?;
        self.publish_message(
            &self.input_queue,
            &payload,
            Some(&message.correlation_id),
            false,
        )
        .await
    }

    /// Publish a status envelope to the status queue.
    pub async fn publish_status(&self, envelope: &StatusEnvelope) -> Result<(), BrokerError> {
        let payload = serde_json::to_value(envelope)?;
        self.publish_message(
            &self.status_queue,
            &payload,
            Some(&envelope.correlation_id),
            false,
        )
        .await
    }

    /// Consume a queue forever with per-message acknowledgement, prefetch
    /// of one, and transparent reconnection on channel loss.
    pub async fn consume_queue(&self, queue: &str, handler: Arc<dyn MessageHandler>) {
        loop {
            if !self.init().await {
                // Only reachable with no URL configured.
                tokio::time::sleep(Duration::from_secs(10)).await;
                continue;
            }
            let Some(channel) = self.channel().await else {
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            };

            let prepared = async {
                channel.basic_qos(1, BasicQosOptions::default()).await?;
                declare_durable(&channel, queue).await?;
                channel
                    .basic_consume(
                        queue,
                        "",
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
            }
            .await;

            let mut consumer = match prepared {
                Ok(consumer) => consumer,
                Err(err) => {
                    tracing::error!(queue, error = %err, "failed to prepare consumer");
                    self.handle_connection_loss().await;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    continue;
                }
            };

            tracing::info!(queue, "consuming");

            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        tracing::warn!(queue, error = %err, "connection lost during consumption");
                        break;
                    }
                };

                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default();
                tracing::debug!(
                    queue,
                    %correlation_id,
                    size = delivery.data.len(),
                    "received message"
                );

                let outcome = match serde_json::from_slice::<Value>(&delivery.data) {
                    Ok(payload) => handler.handle(payload).await,
                    Err(err) => {
                        // Undecodable payloads are discarded, not requeued.
                        tracing::warn!(queue, %correlation_id, error = %err, "discarding undecodable message");
                        Ok(())
                    }
                };

                let settled = match outcome {
                    Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                    Err(err) => {
                        tracing::error!(queue, %correlation_id, error = %err, "handler failed, requeueing message");
                        delivery
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..BasicNackOptions::default()
                            })
                            .await
                    }
                };
                if let Err(err) = settled {
                    tracing::warn!(queue, error = %err, "failed to settle delivery");
                    break;
                }
            }

            self.handle_connection_loss().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<lapin::Queue, lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
}

fn log_connect_failure(err: &lapin::Error) {
    let message = err.to_string();
    let error_kind = if is_dns_failure(&message) { "dns" } else { "connection" };
    tracing::warn!(error = %message, error_kind, "broker connection attempt failed");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn unconfigured() -> BrokerConnector {
        BrokerConnector::new(None, "agent.mandates", "agent.status", Duration::ZERO)
    }

    #[tokio::test]
    async fn unconfigured_broker_stays_unready() {
        let broker = unconfigured();
        assert!(matches!(broker.connect().await, Err(BrokerError::Unconfigured)));
        assert!(!broker.is_ready());
        assert!(broker.get_queue_depth("agent.mandates").await.is_none());
    }

    #[tokio::test]
    async fn publish_exhausts_bounded_attempts() {
        tokio::time::pause();
        let broker = unconfigured();
        let err = broker
            .publish_message("agent.mandates", &json!({"x": 1}), Some("c-1"), false)
            .await
            .unwrap_err();
        match err {
            BrokerError::PublishExhausted { queue, attempts } => {
                assert_eq!(queue, "agent.mandates");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn resilient_publish_reports_false_at_deadline() {
        tokio::time::pause();
        let broker = unconfigured();
        let ok = broker
            .publish_message_resilient(
                "agent.mandates",
                &json!({"x": 1}),
                Some("c-1"),
                Duration::from_secs(30),
            )
            .await;
        assert!(!ok);
    }
}
