//! HTTP task-intake service.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

use euglena::broker::BrokerConnector;
use euglena::gateway::auth::{HttpTokenVerifier, StaticTokenVerifier, TokenVerifier};
use euglena::gateway::{GatewayState, router};
use euglena::health::HealthRegistry;
use euglena::kv::KvConnector;
use euglena::quota::{KvDailyQuota, MemoryDailyQuota, NoopQuota, QuotaManager};
use euglena::settings::Settings;
use euglena::storage::{RedisTaskStorage, WorkerRegistry};

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "Task intake gateway")]
struct Args {
    /// Listen address for the HTTP API.
    #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Quota backend: kv, memory, or none.
    #[arg(long, env = "QUOTA_BACKEND", default_value = "kv")]
    quota: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    euglena::init_tracing();
    let args = Args::parse();
    let settings = Settings::from_env();

    let kv = Arc::new(KvConnector::from_settings(&settings));
    let broker = Arc::new(BrokerConnector::from_settings(&settings));

    // Dependency failures do not abort startup; intake degrades to 503
    // until the stores return and /health shows which one is missing.
    if let Err(err) = kv.connect().await {
        tracing::warn!(error = %err, "kv store not ready at startup");
    }
    if let Err(err) = broker.connect().await {
        tracing::warn!(error = %err, "broker not ready at startup");
    }

    let quota: Arc<dyn QuotaManager> = match args.quota.as_str() {
        "none" => Arc::new(NoopQuota),
        "memory" => Arc::new(MemoryDailyQuota::new(settings.daily_tick_limit)),
        _ => Arc::new(KvDailyQuota::new(kv.clone(), settings.daily_tick_limit)),
    };

    let timeout = Duration::from_secs(settings.default_timeout);
    let verifier: Arc<dyn TokenVerifier> = match &settings.identity_url {
        Some(url) => Arc::new(HttpTokenVerifier::new(url.clone(), timeout)),
        None => match std::env::var("DEV_AUTH_TOKEN") {
            Ok(token) => {
                tracing::warn!("IDENTITY_URL not set; accepting only DEV_AUTH_TOKEN");
                Arc::new(
                    StaticTokenVerifier::new().with_token(token, "dev-user", "dev@localhost"),
                )
            }
            Err(_) => {
                tracing::warn!("IDENTITY_URL not set and no DEV_AUTH_TOKEN; all tokens rejected");
                Arc::new(StaticTokenVerifier::new())
            }
        },
    };

    let health = {
        let broker = broker.clone();
        let kv = kv.clone();
        HealthRegistry::new("gateway")
            .probe("broker", Arc::new(move || broker.is_ready()))
            .probe("kv", Arc::new(move || kv.is_ready()))
    };

    let state = GatewayState {
        store: Arc::new(RedisTaskStorage::new(kv.clone())),
        publisher: broker.clone(),
        directory: Arc::new(WorkerRegistry::new(kv.clone(), settings.presence_ttl())),
        quota,
        verifier,
        health,
    };

    let app = router(state).layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(bind = %args.bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    broker.disconnect().await;
    kv.disconnect().await;
    Ok(())
}
