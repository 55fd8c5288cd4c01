//! Health reporting for the HTTP surfaces.
//!
//! `/health` answers 200 whenever the process is up; the body carries a
//! per-dependency readiness breakdown that is informational only. Liveness
//! is the status code, readiness is the payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

/// Readiness probe for one dependency.
pub type ReadinessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Serializable health payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub components: BTreeMap<String, bool>,
}

/// Tracks named readiness probes for a service.
#[derive(Clone)]
pub struct HealthRegistry {
    service: String,
    version: String,
    probes: Vec<(String, ReadinessProbe)>,
}

impl HealthRegistry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            probes: Vec::new(),
        }
    }

    /// Register a dependency probe evaluated on every report.
    pub fn probe(mut self, name: impl Into<String>, probe: ReadinessProbe) -> Self {
        self.probes.push((name.into(), probe));
        self
    }

    /// Build the current report. The `process` component is always true
    /// for a running process and is the only component that decides the
    /// top-level status.
    pub fn report(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert("process".to_string(), true);
        for (name, probe) in &self.probes {
            components.insert(name.clone(), probe());
        }
        HealthReport {
            status: "healthy",
            service: self.service.clone(),
            version: self.version.clone(),
            components,
        }
    }
}

/// A one-route `/health` router for processes without a public API.
pub fn health_router(registry: HealthRegistry) -> axum::Router {
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn report(State(registry): State<HealthRegistry>) -> Json<HealthReport> {
        Json(registry.report())
    }

    Router::new()
        .route("/health", get(report))
        .with_state(registry)
}
