//! Queue-depth metrics mirror.
//!
//! Samples broker queue depth on a short interval and mirrors it into the
//! KV store, where the autoscaler's mirror source reads it. Keeps its own
//! `/health` so the sampler can be supervised like the other processes.

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;

use euglena::autoscaler::DepthSampler;
use euglena::broker::BrokerConnector;
use euglena::health::{HealthRegistry, health_router};
use euglena::kv::KvConnector;
use euglena::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "metrics", about = "Queue depth sampler")]
struct Args {
    /// Listen address for the health endpoint.
    #[arg(long, env = "METRICS_HEALTH_BIND", default_value = "0.0.0.0:8082")]
    health_bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    euglena::init_tracing();
    let args = Args::parse();
    let settings = Settings::from_env();

    let broker = Arc::new(BrokerConnector::from_settings(&settings));
    let kv = Arc::new(KvConnector::from_settings(&settings));

    if let Err(err) = broker.connect().await {
        tracing::warn!(error = %err, "broker not ready at startup");
    }
    if let Err(err) = kv.connect().await {
        tracing::warn!(error = %err, "kv store not ready at startup");
    }

    let health = {
        let broker = broker.clone();
        let kv = kv.clone();
        HealthRegistry::new("metrics")
            .probe("broker", Arc::new(move || broker.is_ready()))
            .probe("kv", Arc::new(move || kv.is_ready()))
    };
    let listener = tokio::net::TcpListener::bind(&args.health_bind).await?;
    tracing::info!(bind = %args.health_bind, "health endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, health_router(health)).await {
            tracing::error!(error = %err, "health listener failed");
        }
    });

    let mut queues = vec![settings.input_queue.clone()];
    if settings.scaled_queue != settings.input_queue {
        queues.push(settings.scaled_queue.clone());
    }
    let sampler = DepthSampler::new(broker.clone(), kv, queues, settings.metrics_interval);

    tokio::select! {
        _ = sampler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    broker.disconnect().await;
    Ok(())
}
