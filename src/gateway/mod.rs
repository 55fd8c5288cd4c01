//! HTTP task intake.
//!
//! `POST /tasks` validates the bearer token, consumes quota, records the
//! task, and only then publishes it; a 202 means the record exists and
//! the message is on the queue. `GET /tasks/{id}` reads the record back
//! for its owner. `GET /agents` and `GET /agents/count` report live
//! workers, sweeping the registry as they read. `GET /health` answers
//! 200 while the process is up, whatever the dependencies are doing.

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::broker::BrokerConnector;
use crate::contract::{TaskMessage, TaskPatch, TaskRecord, TaskStatus};
use crate::error::AuthError;
use crate::gateway::auth::{Subject, TokenVerifier, bearer_token};
use crate::health::HealthRegistry;
use crate::quota::{QuotaManager, seconds_until_utc_midnight};
use crate::storage::{TaskStore, WorkerDirectory};

/// How long intake waits out a broker outage before giving up on a task.
pub const PUBLISH_MAX_WAIT: Duration = Duration::from_secs(300);

/// Ceiling on a client-supplied tick budget.
const MAX_TICKS_CEILING: u32 = 1000;

/// Resilient publish of a task message onto the input queue.
#[async_trait]
pub trait MandatePublisher: Send + Sync {
    async fn publish_mandate(&self, message: &TaskMessage, max_wait: Duration) -> bool;
}

#[async_trait]
impl MandatePublisher for BrokerConnector {
    async fn publish_mandate(&self, message: &TaskMessage, max_wait: Duration) -> bool {
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "task message failed to serialize");
                return false;
            }
        };
        self.publish_message_resilient(
            &self.input_queue,
            &payload,
            Some(&message.correlation_id),
            max_wait,
        )
        .await
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<dyn TaskStore>,
    pub publisher: Arc<dyn MandatePublisher>,
    pub directory: Arc<dyn WorkerDirectory>,
    pub quota: Arc<dyn QuotaManager>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub health: HealthRegistry,
}

/// Build the gateway router. Task routes sit behind the bearer-token
/// middleware; worker count and health stay open.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/{correlation_id}", get(get_task))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .route("/agents", get(agents_list))
        .route("/agents/count", get(agents_count))
        .route("/health", get(health))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok());

    let subject = match bearer_token(header) {
        Ok(token) => state.verifier.verify(token).await,
        Err(err) => Err(err),
    };

    match subject {
        Ok(subject) => {
            request.extensions_mut().insert(subject);
            next.run(request).await
        }
        Err(AuthError::Unavailable(reason)) => {
            tracing::error!(%reason, "identity service unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "identity service unavailable")
        }
        Err(_) => json_error(StatusCode::UNAUTHORIZED, "missing or invalid token"),
    }
}

async fn submit_task(
    State(state): State<GatewayState>,
    Extension(subject): Extension<Subject>,
    body: axum::body::Bytes,
) -> Response {
    let Ok(body) = serde_json::from_slice::<Value>(&body) else {
        return json_error(StatusCode::BAD_REQUEST, "request body must be JSON");
    };

    let Some(mandate) = body.get("mandate").and_then(Value::as_str).filter(|m| !m.is_empty())
    else {
        return json_error(StatusCode::BAD_REQUEST, "mandate must be a non-empty string");
    };
    let max_ticks = match body.get("max_ticks") {
        None | Some(Value::Null) => 50,
        Some(value) => match value.as_i64() {
            Some(ticks) if ticks >= 1 => (ticks as u64).min(u64::from(MAX_TICKS_CEILING)) as u32,
            _ => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "max_ticks must be a positive integer",
                );
            }
        },
    };

    // Quota is consumed before anything is recorded or published.
    let decision = match state
        .quota
        .check_and_consume(&subject.user_id, &subject.email, max_ticks)
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            tracing::error!(user_id = %subject.user_id, error = %err, "quota backend failed");
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "quota backend unavailable");
        }
    };
    if !decision.allowed {
        tracing::info!(
            user_id = %subject.user_id,
            remaining = decision.remaining.unwrap_or(0),
            "daily tick quota exhausted"
        );
        return quota_exhausted(decision.remaining.unwrap_or(0));
    }

    let correlation_id = Uuid::new_v4().to_string();
    let record = TaskRecord::accepted(
        &correlation_id,
        &subject.user_id,
        &subject.email,
        mandate,
        max_ticks,
    );

    // The record must exist before any consumer can see the message; a
    // task id is never returned unless it was durably written.
    if let Err(err) = state.store.create_task(&record).await {
        tracing::error!(%correlation_id, error = %err, "task record write failed");
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "task storage unavailable");
    }

    let message = TaskMessage::new(correlation_id.clone(), mandate, max_ticks);
    if !state
        .publisher
        .publish_mandate(&message, PUBLISH_MAX_WAIT)
        .await
    {
        tracing::error!(%correlation_id, "task publish failed after resilient retry");
        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            error: Some("broker unavailable".to_string()),
            ..TaskPatch::default()
        };
        state
            .store
            .update_task_resilient(&correlation_id, &patch, PUBLISH_MAX_WAIT)
            .await;
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "broker unavailable");
    }

    tracing::info!(
        %correlation_id,
        user_id = %subject.user_id,
        max_ticks,
        "task accepted"
    );
    (
        StatusCode::ACCEPTED,
        Json(json!({ "correlation_id": correlation_id })),
    )
        .into_response()
}

async fn get_task(
    State(state): State<GatewayState>,
    Extension(subject): Extension<Subject>,
    Path(correlation_id): Path<String>,
) -> Response {
    let Some(record) = state.store.get_task(&correlation_id).await else {
        return json_error(StatusCode::NOT_FOUND, "task not found");
    };
    // Not-owned looks identical to not-found; existence is not disclosed.
    if record.user_id.as_deref() != Some(subject.user_id.as_str()) {
        return json_error(StatusCode::NOT_FOUND, "task not found");
    }
    Json(record).into_response()
}

async fn agents_list(State(state): State<GatewayState>) -> Response {
    let workers = state.directory.active_workers().await;
    Json(json!({ "workers": workers })).into_response()
}

async fn agents_count(State(state): State<GatewayState>) -> Response {
    let count = state.directory.worker_count().await;
    Json(json!({ "count": count })).into_response()
}

async fn health(State(state): State<GatewayState>) -> Response {
    Json(state.health.report()).into_response()
}

fn quota_exhausted(remaining: i64) -> Response {
    let retry_after = seconds_until_utc_midnight();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(json!({ "remaining": remaining })),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
