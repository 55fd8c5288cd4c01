//! The agent worker process.
//!
//! One worker consumes one task at a time from the input queue and hosts
//! three cooperative tasks: the presence loop (always), the consumer loop
//! (always), and a status heartbeat that exists only while a task is
//! running. For each task it publishes the envelope sequence
//! `accepted -> started -> in_progress* -> completed | error` and mirrors
//! every transition into the task record with a resilient write.

mod presence;
mod state;

pub use presence::WorkerPresence;
pub use state::{WorkerStateStore, is_protected};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::agent::{AgentEngine, AgentProbe, interpret_outcome};
use crate::broker::{BrokerConnector, MessageHandler};
use crate::contract::{CompletionResult, StatusEnvelope, StatusKind, TaskMessage, TaskPatch};
use crate::error::BrokerError;
use crate::kv::KvConnector;
use crate::settings::Settings;
use crate::storage::{RedisTaskStorage, TaskStore, WorkerRegistry, WorkerStatus};

/// Wall-clock budget for mirroring a status transition into storage.
const MIRROR_MAX_WAIT: Duration = Duration::from_secs(300);

/// Destination for status envelopes. The broker connector is the
/// production sink; tests record instead.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, envelope: &StatusEnvelope) -> Result<(), BrokerError>;
}

#[async_trait]
impl StatusSink for BrokerConnector {
    async fn publish(&self, envelope: &StatusEnvelope) -> Result<(), BrokerError> {
        self.publish_status(envelope).await
    }
}

type HeartbeatSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Per-worker task handler: parses the payload, runs the agent, and
/// publishes the status sequence. Malformed payloads are logged and
/// dropped (the delivery is acked); agent failures terminate the task,
/// never the worker.
pub struct TaskRunner {
    core: Arc<RunnerCore>,
}

struct RunnerCore {
    sink: Arc<dyn StatusSink>,
    storage: Arc<dyn TaskStore>,
    engine: Arc<dyn AgentEngine>,
    state: Arc<WorkerStateStore>,
    activity: watch::Sender<WorkerStatus>,
    heartbeat: HeartbeatSlot,
    status_period: Duration,
    state_ttl: Duration,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: Arc<dyn StatusSink>,
        storage: Arc<dyn TaskStore>,
        engine: Arc<dyn AgentEngine>,
        state: Arc<WorkerStateStore>,
        activity: watch::Sender<WorkerStatus>,
        heartbeat: HeartbeatSlot,
        status_period: Duration,
        state_ttl: Duration,
    ) -> Self {
        Self {
            core: Arc::new(RunnerCore {
                sink,
                storage,
                engine,
                state,
                activity,
                heartbeat,
                status_period,
                state_ttl,
            }),
        }
    }
}

#[async_trait]
impl MessageHandler for TaskRunner {
    async fn handle(&self, payload: Value) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(message) = TaskMessage::parse(&payload) else {
            // Already-processed semantics: ack and forget, never poison
            // the queue with a payload nobody can handle.
            tracing::warn!("invalid task payload, missing mandate or correlation_id");
            return Ok(());
        };

        tracing::info!(
            correlation_id = %message.correlation_id,
            max_ticks = message.max_ticks,
            mandate_preview = %preview(&message.mandate),
            "starting task"
        );

        let _ = self.core.activity.send(WorkerStatus::Working);
        self.core
            .state
            .set_state(WorkerStatus::Working, self.core.state_ttl)
            .await;

        let result = RunnerCore::run_task(&self.core, &message).await;

        if let Some(handle) = self.core.heartbeat.lock().await.take() {
            handle.abort();
        }
        let _ = self.core.activity.send(WorkerStatus::Idle);
        self.core
            .state
            .set_state(WorkerStatus::Idle, self.core.state_ttl)
            .await;

        result.map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
    }
}

impl RunnerCore {
    /// Publish an envelope and mirror it into the task record. Writers
    /// racing on the record carry their full intended state in the patch.
    async fn publish_transition(
        &self,
        message: &TaskMessage,
        kind: StatusKind,
    ) -> Result<(), BrokerError> {
        let envelope = StatusEnvelope {
            kind,
            correlation_id: message.correlation_id.clone(),
            task_id: message.task_id.clone(),
            mandate: message.mandate.clone(),
            max_ticks: message.max_ticks,
        };
        self.sink.publish(&envelope).await?;

        let mut patch = TaskPatch {
            status: Some(envelope.record_status()),
            mandate: Some(message.mandate.clone()),
            max_ticks: Some(message.max_ticks),
            ..TaskPatch::default()
        };
        match &envelope.kind {
            StatusKind::InProgress { tick, .. } => patch.tick = Some(*tick),
            StatusKind::Completed { result } => patch.result = Some(result.clone()),
            StatusKind::Error { error } => patch.error = Some(error.clone()),
            StatusKind::Accepted | StatusKind::Started => {}
        }
        if !self
            .storage
            .update_task_resilient(&message.correlation_id, &patch, MIRROR_MAX_WAIT)
            .await
        {
            tracing::error!(
                correlation_id = %message.correlation_id,
                "failed to mirror status transition into storage"
            );
        }
        Ok(())
    }

    async fn run_task(core: &Arc<Self>, message: &TaskMessage) -> Result<(), BrokerError> {
        let this = core.as_ref();
        this.publish_transition(message, StatusKind::Accepted).await?;
        this.publish_transition(message, StatusKind::Started).await?;

        let probe = AgentProbe::new();
        Self::spawn_heartbeat(core, message.clone(), probe.clone()).await;

        match this.engine.run(&message.mandate, message.max_ticks, &probe).await {
            Ok(outcome) => {
                let (success, deliverables, notes) = interpret_outcome(&outcome, &probe);
                tracing::info!(
                    correlation_id = %message.correlation_id,
                    success,
                    deliverables_count = deliverables.len(),
                    "task completed"
                );
                let result = CompletionResult {
                    task_id: message.task_id.clone(),
                    success,
                    deliverables,
                    notes,
                };
                this.publish_transition(message, StatusKind::Completed { result })
                    .await
            }
            Err(err) => {
                tracing::error!(
                    correlation_id = %message.correlation_id,
                    error = %err,
                    "agent execution failed"
                );
                this.publish_transition(
                    message,
                    StatusKind::Error {
                        error: err.to_string(),
                    },
                )
                .await
            }
        }
    }

    /// Background loop publishing `in_progress` with the probe's counters
    /// every status period while the task runs. Also keeps the scale-in
    /// protection key fresh.
    async fn spawn_heartbeat(core: &Arc<Self>, message: TaskMessage, probe: AgentProbe) {
        let slot = core.heartbeat.clone();
        let core = Arc::clone(core);
        let handle = tokio::spawn(async move {
            loop {
                let kind = StatusKind::InProgress {
                    tick: probe.current_tick(),
                    history_length: Some(probe.history_len()),
                    notes_len: Some(probe.notes_len()),
                    deliverables_count: Some(probe.deliverables_count()),
                };
                if let Err(err) = core.publish_transition(&message, kind).await {
                    tracing::warn!(
                        correlation_id = %message.correlation_id,
                        error = %err,
                        "heartbeat publish failed"
                    );
                }
                core.state
                    .set_state(WorkerStatus::Working, core.state_ttl)
                    .await;
                tokio::time::sleep(core.status_period).await;
            }
        });
        *slot.lock().await = Some(handle);
    }
}

struct RunningTasks {
    consumer: JoinHandle<()>,
    presence: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// The worker process: owns the connectors and the cooperative tasks.
pub struct AgentWorker {
    settings: Settings,
    broker: Arc<BrokerConnector>,
    kv: Arc<KvConnector>,
    storage: Arc<RedisTaskStorage>,
    registry: Arc<WorkerRegistry>,
    state: Arc<WorkerStateStore>,
    engine: Arc<dyn AgentEngine>,
    worker_id: String,
    ready: AtomicBool,
    activity: watch::Sender<WorkerStatus>,
    heartbeat: HeartbeatSlot,
    running: Mutex<Option<RunningTasks>>,
}

impl AgentWorker {
    pub fn new(settings: Settings, engine: Arc<dyn AgentEngine>) -> Self {
        let kv = Arc::new(KvConnector::from_settings(&settings));
        let broker = Arc::new(BrokerConnector::from_settings(&settings));
        let storage = Arc::new(RedisTaskStorage::new(kv.clone()));
        let registry = Arc::new(WorkerRegistry::new(kv.clone(), settings.presence_ttl()));
        let worker_id = make_worker_id();
        let state = Arc::new(WorkerStateStore::new(
            kv.clone(),
            &settings.worker_state_prefix,
            &worker_id,
        ));
        let (activity, _) = watch::channel(WorkerStatus::Idle);

        Self {
            settings,
            broker,
            kv,
            storage,
            registry,
            state,
            engine,
            worker_id,
            ready: AtomicBool::new(false),
            activity,
            heartbeat: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn broker(&self) -> Arc<BrokerConnector> {
        self.broker.clone()
    }

    pub fn kv(&self) -> Arc<KvConnector> {
        self.kv.clone()
    }

    /// Connect dependencies and launch the presence and consumer tasks.
    /// Idempotent; a second call is a no-op. Dependency failures do not
    /// abort startup: the consumer loop keeps reconnecting on its own
    /// schedule and `/health` reports the degraded components.
    pub async fn start(&self) {
        if self.ready.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(worker_id = %self.worker_id, "worker starting");

        if let Err(err) = self.broker.connect().await {
            tracing::warn!(error = %err, "broker not ready at startup, consumer will keep retrying");
        }
        if !self.kv.init().await {
            tracing::warn!("kv store not ready at startup, presence degrades until it returns");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let presence = WorkerPresence::new(
            self.registry.clone(),
            self.worker_id.clone(),
            self.settings.status_period,
            self.activity.subscribe(),
        );
        let presence_handle = tokio::spawn(presence.run(shutdown_rx));

        let runner = TaskRunner::new(
            self.broker.clone(),
            self.storage.clone(),
            self.engine.clone(),
            self.state.clone(),
            self.activity.clone(),
            self.heartbeat.clone(),
            self.settings.status_period,
            self.settings.presence_ttl(),
        );
        let broker = self.broker.clone();
        let queue = self.settings.input_queue.clone();
        let consumer_handle = tokio::spawn(async move {
            broker.consume_queue(&queue, Arc::new(runner)).await;
        });

        *self.running.lock().await = Some(RunningTasks {
            consumer: consumer_handle,
            presence: presence_handle,
            shutdown_tx,
        });
        tracing::info!(
            worker_id = %self.worker_id,
            input_queue = %self.settings.input_queue,
            "worker started"
        );
    }

    /// Tear down in order: consumer, heartbeat, presence (waiting for its
    /// final publish), protection key, broker. The whole teardown is
    /// bounded by the shutdown timeout; a stage that overruns is
    /// force-progressed. Idempotent.
    pub async fn stop(&self) {
        if !self.ready.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        tracing::info!(worker_id = %self.worker_id, "worker stopping");
        let deadline = tokio::time::Instant::now() + self.settings.shutdown_timeout;

        running.consumer.abort();
        let _ = running.consumer.await;

        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        let _ = running.shutdown_tx.send(true);
        let presence_abort = running.presence.abort_handle();
        if tokio::time::timeout_at(deadline, running.presence).await.is_err() {
            tracing::warn!("presence loop overran shutdown budget, aborting");
            presence_abort.abort();
        }

        self.state.delete_state().await;

        if tokio::time::timeout_at(deadline, self.broker.disconnect())
            .await
            .is_err()
        {
            tracing::warn!("broker disconnect overran shutdown budget");
        }
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }
}

fn make_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

fn preview(mandate: &str) -> &str {
    let cut = mandate
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(mandate.len());
    &mandate[..cut]
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::agent::EchoEngine;
    use crate::contract::TaskStatus;
    use crate::storage::MemoryTaskStore;

    use super::*;

    struct RecordingSink {
        envelopes: Mutex<Vec<StatusEnvelope>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                envelopes: Mutex::new(Vec::new()),
            }
        }

        async fn kinds(&self) -> Vec<String> {
            self.envelopes
                .lock()
                .await
                .iter()
                .map(|e| match &e.kind {
                    StatusKind::Accepted => "accepted".to_string(),
                    StatusKind::Started => "started".to_string(),
                    StatusKind::InProgress { .. } => "in_progress".to_string(),
                    StatusKind::Completed { .. } => "completed".to_string(),
                    StatusKind::Error { .. } => "error".to_string(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn publish(&self, envelope: &StatusEnvelope) -> Result<(), BrokerError> {
            self.envelopes.lock().await.push(envelope.clone());
            Ok(())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl AgentEngine for FailingEngine {
        async fn run(
            &self,
            _mandate: &str,
            _max_ticks: u32,
            _probe: &AgentProbe,
        ) -> Result<crate::agent::AgentOutcome, crate::error::AgentError> {
            Err(crate::error::AgentError::Failed("engine exploded".into()))
        }
    }

    fn runner_parts(
        engine: Arc<dyn AgentEngine>,
    ) -> (TaskRunner, Arc<RecordingSink>, Arc<MemoryTaskStore>) {
        let sink = Arc::new(RecordingSink::new());
        let storage = Arc::new(MemoryTaskStore::new());
        let kv = Arc::new(KvConnector::new(None, Duration::ZERO));
        let state = Arc::new(WorkerStateStore::new(kv, "worker_state", "test:1"));
        let (activity, _) = watch::channel(WorkerStatus::Idle);
        let runner = TaskRunner::new(
            sink.clone(),
            storage.clone(),
            engine,
            state,
            activity,
            Arc::new(Mutex::new(None)),
            Duration::from_secs(10),
            Duration::from_secs(30),
        );
        (runner, sink, storage)
    }

    #[tokio::test]
    async fn happy_path_publishes_full_sequence() {
        let (runner, sink, storage) = runner_parts(Arc::new(EchoEngine {
            tick_delay: Duration::ZERO,
        }));
        let payload = json!({
            "correlation_id": "c-1",
            "task_id": "c-1",
            "mandate": "Say 'ok' and exit",
            "max_ticks": 2,
        });

        runner.handle(payload).await.unwrap();

        let kinds = sink.kinds().await;
        assert_eq!(kinds[0], "accepted");
        assert_eq!(kinds[1], "started");
        assert_eq!(kinds.last().unwrap(), "completed");

        let record = storage.get_task("c-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        let result = record.result.unwrap();
        assert!(result.success);
        assert_eq!(result.task_id, "c-1");
        assert_eq!(result.deliverables.len(), 1);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_discarded_silently() {
        let (runner, sink, storage) = runner_parts(Arc::new(EchoEngine {
            tick_delay: Duration::ZERO,
        }));

        // Missing mandate: acked, no status, no record.
        runner.handle(json!({"correlation_id": "abc"})).await.unwrap();

        assert!(sink.envelopes.lock().await.is_empty());
        assert!(storage.get_task("abc").await.is_none());
    }

    #[tokio::test]
    async fn engine_failure_records_failed_status() {
        let (runner, sink, storage) = runner_parts(Arc::new(FailingEngine));
        let payload = json!({
            "correlation_id": "c-2",
            "mandate": "doomed",
        });

        runner.handle(payload).await.unwrap();

        let kinds = sink.kinds().await;
        assert_eq!(kinds.last().unwrap(), "error");

        let record = storage.get_task("c-2").await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.contains("engine exploded"));
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn legacy_task_id_payload_is_accepted() {
        let (runner, _sink, storage) = runner_parts(Arc::new(EchoEngine {
            tick_delay: Duration::ZERO,
        }));
        runner
            .handle(json!({"task_id": "legacy-1", "mandate": "do"}))
            .await
            .unwrap();
        let record = storage.get_task("legacy-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let settings = Settings::default();
        let worker = AgentWorker::new(
            settings,
            Arc::new(EchoEngine {
                tick_delay: Duration::ZERO,
            }),
        );

        worker.start().await;
        worker.start().await;
        assert!(worker.running.lock().await.is_some());

        worker.stop().await;
        assert!(worker.running.lock().await.is_none());
        worker.stop().await;
    }
}
