//! Agent worker process.
//!
//! Consumes one task at a time from the input queue and runs the agent
//! engine against it. A small health listener stays reachable even while
//! the broker or KV store is down, so orchestrators can tell "degraded"
//! from "dead".

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;

use euglena::agent::EchoEngine;
use euglena::health::{HealthRegistry, health_router};
use euglena::settings::Settings;
use euglena::worker::AgentWorker;

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Agent worker")]
struct Args {
    /// Listen address for the health endpoint.
    #[arg(long, env = "WORKER_HEALTH_BIND", default_value = "0.0.0.0:8081")]
    health_bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    euglena::init_tracing();
    let args = Args::parse();
    let settings = Settings::from_env();

    let worker = Arc::new(AgentWorker::new(settings, Arc::new(EchoEngine::default())));
    tracing::info!(worker_id = %worker.worker_id(), "worker process starting");

    let health = {
        let broker = worker.broker();
        let kv = worker.kv();
        HealthRegistry::new("agent-worker")
            .probe("broker", Arc::new(move || broker.is_ready()))
            .probe("kv", Arc::new(move || kv.is_ready()))
    };
    // A bind failure is a real misconfiguration, not a dependency blip;
    // it is allowed to fail the process with a non-zero exit.
    let listener = tokio::net::TcpListener::bind(&args.health_bind).await?;
    tracing::info!(bind = %args.health_bind, "health endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, health_router(health)).await {
            tracing::error!(error = %err, "health listener failed");
        }
    });

    worker.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    worker.stop().await;
    Ok(())
}
