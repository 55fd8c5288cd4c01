//! The agent is an opaque computation: it takes a mandate string, runs for
//! up to `max_ticks` ticks, and produces a result envelope. The reasoning
//! engine itself lives behind [`AgentEngine`]; this crate ships
//! [`EchoEngine`] so the execution plane can run end to end without one.
//!
//! While a run is in flight the worker's heartbeat reads live counters
//! through the shared [`AgentProbe`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// Live counters for an agent run, shared between the run and the
/// heartbeat publisher. All reads are point-in-time snapshots.
#[derive(Clone, Default)]
pub struct AgentProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Default)]
struct ProbeInner {
    current_tick: AtomicU32,
    history_len: AtomicUsize,
    notes_len: AtomicUsize,
    deliverables: std::sync::Mutex<Vec<Value>>,
}

impl AgentProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_tick(&self) -> u32 {
        self.inner.current_tick.load(Ordering::Relaxed)
    }

    pub fn history_len(&self) -> usize {
        self.inner.history_len.load(Ordering::Relaxed)
    }

    pub fn notes_len(&self) -> usize {
        self.inner.notes_len.load(Ordering::Relaxed)
    }

    pub fn deliverables(&self) -> Vec<Value> {
        self.inner.deliverables.lock().expect("probe lock").clone()
    }

    pub fn deliverables_count(&self) -> usize {
        self.inner.deliverables.lock().expect("probe lock").len()
    }

    pub fn record_tick(&self, tick: u32) {
        self.inner.current_tick.store(tick, Ordering::Relaxed);
    }

    pub fn record_history(&self, entries: usize) {
        self.inner.history_len.store(entries, Ordering::Relaxed);
    }

    pub fn record_notes_len(&self, len: usize) {
        self.inner.notes_len.store(len, Ordering::Relaxed);
    }

    pub fn push_deliverable(&self, deliverable: Value) {
        self.inner
            .deliverables
            .lock()
            .expect("probe lock")
            .push(deliverable);
    }
}

/// Result envelope produced by an engine. Engines differ in which fields
/// they fill; [`interpret_outcome`] folds the variants into one
/// completion shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverables: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_deliverable: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_summary: Option<String>,
}

/// The reasoning engine seam. Implementations must keep the probe current
/// as they tick; everything the heartbeat reports comes from it.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn run(
        &self,
        mandate: &str,
        max_ticks: u32,
        probe: &AgentProbe,
    ) -> Result<AgentOutcome, AgentError>;
}

/// Interpretation of an engine's outcome into completion fields:
/// success defaults to true; deliverables prefer the envelope, then the
/// probe, then a lone `final_deliverable`; notes fall back to the action
/// summary.
pub fn interpret_outcome(outcome: &AgentOutcome, probe: &AgentProbe) -> (bool, Vec<Value>, String) {
    let success = outcome.success.unwrap_or(true);

    let deliverables = match &outcome.deliverables {
        Some(deliverables) => deliverables.clone(),
        None => {
            let probed = probe.deliverables();
            if !probed.is_empty() {
                probed
            } else if let Some(last) = &outcome.final_deliverable {
                vec![last.clone()]
            } else {
                Vec::new()
            }
        }
    };

    let notes = outcome
        .notes
        .clone()
        .or_else(|| outcome.action_summary.clone())
        .unwrap_or_default();

    (success, deliverables, notes)
}

/// Minimal engine used when no reasoning engine is wired in: performs one
/// tick, echoes the mandate back as its deliverable, and succeeds.
pub struct EchoEngine {
    /// Artificial work per tick, so heartbeats are observable in dev runs.
    pub tick_delay: Duration,
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self {
            tick_delay: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl AgentEngine for EchoEngine {
    async fn run(
        &self,
        mandate: &str,
        max_ticks: u32,
        probe: &AgentProbe,
    ) -> Result<AgentOutcome, AgentError> {
        if max_ticks == 0 {
            return Err(AgentError::Failed("tick budget is zero".to_string()));
        }
        probe.record_tick(1);
        probe.record_history(1);
        tokio::time::sleep(self.tick_delay).await;

        let echo = serde_json::json!({ "echo": mandate });
        probe.push_deliverable(echo.clone());
        probe.record_notes_len(mandate.len());

        Ok(AgentOutcome {
            success: Some(true),
            deliverables: Some(vec![echo]),
            notes: Some(format!("echoed mandate after 1 of {max_ticks} ticks")),
            ..AgentOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn echo_engine_completes_in_one_tick() {
        let probe = AgentProbe::new();
        let engine = EchoEngine {
            tick_delay: Duration::ZERO,
        };
        let outcome = engine.run("say ok", 2, &probe).await.unwrap();
        assert_eq!(probe.current_tick(), 1);
        assert_eq!(outcome.success, Some(true));

        let (success, deliverables, notes) = interpret_outcome(&outcome, &probe);
        assert!(success);
        assert_eq!(deliverables, vec![json!({"echo": "say ok"})]);
        assert!(notes.contains("1 of 2"));
    }

    #[tokio::test]
    async fn echo_engine_rejects_zero_budget() {
        let probe = AgentProbe::new();
        let engine = EchoEngine {
            tick_delay: Duration::ZERO,
        };
        assert!(engine.run("m", 0, &probe).await.is_err());
    }

    #[test]
    fn interpretation_precedence() {
        let probe = AgentProbe::new();

        // Envelope deliverables win.
        let outcome = AgentOutcome {
            deliverables: Some(vec![json!(1)]),
            final_deliverable: Some(json!(2)),
            ..AgentOutcome::default()
        };
        probe.push_deliverable(json!(3));
        let (_, deliverables, _) = interpret_outcome(&outcome, &probe);
        assert_eq!(deliverables, vec![json!(1)]);

        // Probe deliverables beat final_deliverable.
        let outcome = AgentOutcome {
            final_deliverable: Some(json!(2)),
            ..AgentOutcome::default()
        };
        let (_, deliverables, _) = interpret_outcome(&outcome, &probe);
        assert_eq!(deliverables, vec![json!(3)]);

        // Empty probe falls back to final_deliverable.
        let empty_probe = AgentProbe::new();
        let (_, deliverables, _) = interpret_outcome(&outcome, &empty_probe);
        assert_eq!(deliverables, vec![json!(2)]);

        // Nothing anywhere yields no deliverables, success defaults true.
        let (success, deliverables, notes) =
            interpret_outcome(&AgentOutcome::default(), &empty_probe);
        assert!(success);
        assert!(deliverables.is_empty());
        assert_eq!(notes, "");

        // Notes fall back to the action summary.
        let outcome = AgentOutcome {
            action_summary: Some("did things".to_string()),
            ..AgentOutcome::default()
        };
        let (_, _, notes) = interpret_outcome(&outcome, &empty_probe);
        assert_eq!(notes, "did things");
    }
}
