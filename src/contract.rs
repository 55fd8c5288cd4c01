//! Wire and storage shapes shared by the gateway, the workers, and every
//! consumer of the status queue.
//!
//! The status envelope is a sum type tagged by its `type` field; the task
//! message tolerates historical producers that wrote `task_id` instead of
//! `correlation_id` by folding both keys onto one field at parse time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persisted task lifecycle state. Monotone along
/// `accepted -> in_progress -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Accepted,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Accepted => "accepted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Completion payload recorded on the task and carried by the terminal
/// status envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub deliverables: Vec<Value>,
    #[serde(default)]
    pub notes: String,
}

/// Transition-specific part of a status envelope, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusKind {
    Accepted,
    Started,
    InProgress {
        tick: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        history_length: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        notes_len: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        deliverables_count: Option<usize>,
    },
    Completed {
        result: CompletionResult,
    },
    Error {
        error: String,
    },
}

/// One record on the status queue, marking a transition of a single task.
///
/// Ordering is guaranteed only on the publishing worker; readers reconcile
/// through the KV record, which is the authority for task status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    #[serde(flatten)]
    pub kind: StatusKind,
    pub correlation_id: String,
    pub task_id: String,
    pub mandate: String,
    pub max_ticks: u32,
}

impl StatusEnvelope {
    /// The task-record status this envelope mirrors to. `started` and
    /// `in_progress` both land on `in_progress`; `error` lands on `failed`.
    pub fn record_status(&self) -> TaskStatus {
        match self.kind {
            StatusKind::Accepted => TaskStatus::Accepted,
            StatusKind::Started | StatusKind::InProgress { .. } => TaskStatus::InProgress,
            StatusKind::Completed { .. } => TaskStatus::Completed,
            StatusKind::Error { .. } => TaskStatus::Failed,
        }
    }
}

/// Message published to the input queue for each accepted task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMessage {
    pub correlation_id: String,
    pub task_id: String,
    pub mandate: String,
    pub max_ticks: u32,
}

impl TaskMessage {
    pub fn new(correlation_id: impl Into<String>, mandate: impl Into<String>, max_ticks: u32) -> Self {
        let correlation_id = correlation_id.into();
        Self {
            task_id: correlation_id.clone(),
            correlation_id,
            mandate: mandate.into(),
            max_ticks,
        }
    }

    /// Parse a consumed payload, accepting `task_id` as an alias for
    /// `correlation_id`. Returns `None` when the payload is malformed
    /// (no id or no mandate); such messages are discarded, never requeued.
    pub fn parse(payload: &Value) -> Option<Self> {
        let correlation_id = non_empty_str(payload.get("correlation_id"))
            .or_else(|| non_empty_str(payload.get("task_id")))?
            .to_string();
        let task_id = non_empty_str(payload.get("task_id"))
            .map(str::to_string)
            .unwrap_or_else(|| correlation_id.clone());
        let mandate = non_empty_str(payload.get("mandate"))?.to_string();
        let max_ticks = payload
            .get("max_ticks")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(50);
        Some(Self {
            correlation_id,
            task_id,
            mandate,
            max_ticks,
        })
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Task record persisted under `task:{correlation_id}`.
///
/// Written by the gateway at intake and mutated only by the worker that
/// owns the correlation id. Readers must treat `status` here as the truth
/// over anything observed on the status queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ticks: Option<u32>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CompletionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh `accepted` record as minted by the gateway.
    pub fn accepted(
        correlation_id: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        mandate: impl Into<String>,
        max_ticks: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            user_id: Some(user_id.into()),
            email: Some(email.into()),
            mandate: Some(mandate.into()),
            max_ticks: Some(max_ticks),
            status: TaskStatus::Accepted,
            tick: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Skeleton used when a patch arrives for a record the TTL already
    /// evicted; the worker's full-state patches reconstruct the rest.
    pub fn skeleton(correlation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            user_id: None,
            email: None,
            mandate: None,
            max_ticks: None,
            status: TaskStatus::Accepted,
            tick: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update merged into a task record. Writers racing on the same
/// record must carry their full intended state here; the merge is
/// last-writer-wins per field with no cross-call atomicity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ticks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CompletionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Merge into `record`, overwriting only the fields present.
    /// `updated_at` is bumped by the storage layer, not here.
    pub fn apply(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(mandate) = &self.mandate {
            record.mandate = Some(mandate.clone());
        }
        if let Some(tick) = self.tick {
            record.tick = Some(tick);
        }
        if let Some(max_ticks) = self.max_ticks {
            record.max_ticks = Some(max_ticks);
        }
        if let Some(result) = &self.result {
            record.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            record.error = Some(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelopes = vec![
            StatusEnvelope {
                kind: StatusKind::Accepted,
                correlation_id: "c-1".into(),
                task_id: "c-1".into(),
                mandate: "survey the field".into(),
                max_ticks: 50,
            },
            StatusEnvelope {
                kind: StatusKind::InProgress {
                    tick: 7,
                    history_length: Some(14),
                    notes_len: Some(512),
                    deliverables_count: Some(1),
                },
                correlation_id: "c-2".into(),
                task_id: "c-2".into(),
                mandate: "dig deeper".into(),
                max_ticks: 20,
            },
            StatusEnvelope {
                kind: StatusKind::Completed {
                    result: CompletionResult {
                        task_id: "c-3".into(),
                        success: true,
                        deliverables: vec![json!({"kind": "summary"})],
                        notes: "done".into(),
                    },
                },
                correlation_id: "c-3".into(),
                task_id: "c-3".into(),
                mandate: "wrap up".into(),
                max_ticks: 2,
            },
            StatusEnvelope {
                kind: StatusKind::Error {
                    error: "engine exploded".into(),
                },
                correlation_id: "c-4".into(),
                task_id: "c-4".into(),
                mandate: "doomed".into(),
                max_ticks: 5,
            },
        ];

        for envelope in envelopes {
            let wire = serde_json::to_value(&envelope).unwrap();
            let back: StatusEnvelope = serde_json::from_value(wire).unwrap();
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn envelope_type_tag_uses_literal_strings() {
        let envelope = StatusEnvelope {
            kind: StatusKind::Started,
            correlation_id: "c".into(),
            task_id: "c".into(),
            mandate: "m".into(),
            max_ticks: 1,
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "started");

        let error = StatusEnvelope {
            kind: StatusKind::Error { error: "x".into() },
            ..envelope
        };
        assert_eq!(serde_json::to_value(&error).unwrap()["type"], "error");
    }

    #[test]
    fn record_status_mapping() {
        let mut envelope = StatusEnvelope {
            kind: StatusKind::Accepted,
            correlation_id: "c".into(),
            task_id: "c".into(),
            mandate: "m".into(),
            max_ticks: 1,
        };
        assert_eq!(envelope.record_status(), TaskStatus::Accepted);

        envelope.kind = StatusKind::Started;
        assert_eq!(envelope.record_status(), TaskStatus::InProgress);

        envelope.kind = StatusKind::Error { error: "e".into() };
        assert_eq!(envelope.record_status(), TaskStatus::Failed);
    }

    #[test]
    fn task_message_accepts_either_id_key() {
        let canonical = json!({
            "correlation_id": "abc",
            "task_id": "abc",
            "mandate": "do it",
            "max_ticks": 3,
        });
        let parsed = TaskMessage::parse(&canonical).unwrap();
        assert_eq!(parsed.correlation_id, "abc");
        assert_eq!(parsed.max_ticks, 3);

        let legacy = json!({"task_id": "xyz", "mandate": "do it"});
        let parsed = TaskMessage::parse(&legacy).unwrap();
        assert_eq!(parsed.correlation_id, "xyz");
        assert_eq!(parsed.task_id, "xyz");
        assert_eq!(parsed.max_ticks, 50);
    }

    #[test]
    fn malformed_task_messages_are_rejected() {
        assert!(TaskMessage::parse(&json!({"correlation_id": "abc"})).is_none());
        assert!(TaskMessage::parse(&json!({"mandate": "orphan"})).is_none());
        assert!(TaskMessage::parse(&json!({"correlation_id": "", "mandate": "m"})).is_none());
        assert!(TaskMessage::parse(&json!("not an object")).is_none());
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut record = TaskRecord::accepted("c-9", "u-1", "u@example.com", "mandate", 10);
        let created = record.created_at;

        TaskPatch {
            status: Some(TaskStatus::InProgress),
            tick: Some(4),
            ..TaskPatch::default()
        }
        .apply(&mut record);

        assert_eq!(record.status, TaskStatus::InProgress);
        assert_eq!(record.tick, Some(4));
        assert_eq!(record.mandate.as_deref(), Some("mandate"));
        assert_eq!(record.user_id.as_deref(), Some("u-1"));
        assert_eq!(record.created_at, created);
    }

    #[test]
    fn record_omits_absent_optionals_on_the_wire() {
        let record = TaskRecord::skeleton("c-0");
        let wire = serde_json::to_value(&record).unwrap();
        assert!(wire.get("result").is_none());
        assert!(wire.get("error").is_none());
        assert_eq!(wire["status"], "accepted");
    }
}
