//! Distributed execution plane for long-running autonomous agent mandates.
//!
//! A mandate enters through the HTTP gateway, is recorded in the key/value
//! store, published durably to the input queue, and picked up by exactly one
//! worker from an elastic pool. The worker runs the agent to completion,
//! emitting periodic status envelopes, and persists the outcome so clients
//! can poll for it. A periodic autoscaler sizes the pool from backlog depth
//! while never scaling in below the number of protected (busy) workers.
//!
//! Layering, leaves first: [`retry`] is composed by every connector;
//! [`broker`] and [`kv`] wrap the two external stores; [`storage`] and
//! [`quota`] are thin domain layers on top of [`kv`]; [`worker`],
//! [`gateway`] and [`autoscaler`] are the three processes.

/// Install the global tracing subscriber for a binary. `RUST_LOG` narrows
/// the filter; the default keeps the crate at info.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub mod agent;
pub mod autoscaler;
pub mod broker;
pub mod contract;
pub mod error;
pub mod gateway;
pub mod health;
pub mod kv;
pub mod quota;
pub mod retry;
pub mod settings;
pub mod storage;
pub mod worker;
