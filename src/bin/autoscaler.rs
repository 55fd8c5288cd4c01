//! Periodic pool-sizing loop.
//!
//! Reads backlog depth (from the KV mirror by default, or straight from
//! the broker), counts protected workers, and pushes the desired count to
//! the orchestration API. `--once` fits external schedulers that invoke
//! it per tick.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

use euglena::autoscaler::{
    Autoscaler, BacklogSource, BrokerBacklog, HttpWorkerPool, KvProtection, MirrorBacklog,
    ScaleLimits,
};
use euglena::broker::BrokerConnector;
use euglena::kv::KvConnector;
use euglena::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "autoscaler", about = "Worker pool autoscaler")]
struct Args {
    /// Run a single decision and exit.
    #[arg(long)]
    once: bool,

    /// Seconds between decisions when looping.
    #[arg(long, env = "AUTOSCALE_INTERVAL_SECONDS", default_value_t = 60)]
    interval: u64,

    /// Backlog source: mirror (KV sample) or broker (live depth).
    #[arg(long, env = "BACKLOG_SOURCE", default_value = "mirror")]
    source: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    euglena::init_tracing();
    let args = Args::parse();
    let settings = Settings::from_env();

    let Some(orchestrator_url) = settings.orchestrator_url.clone() else {
        anyhow::bail!("ORCHESTRATOR_URL must be set for the autoscaler");
    };

    let kv = Arc::new(KvConnector::from_settings(&settings));
    let backlog: Arc<dyn BacklogSource> = match args.source.as_str() {
        "broker" => Arc::new(BrokerBacklog::new(Arc::new(BrokerConnector::from_settings(
            &settings,
        )))),
        _ => Arc::new(MirrorBacklog::new(kv.clone())),
    };

    let scaler = Autoscaler::new(
        settings.scaled_queue.clone(),
        ScaleLimits::from_settings(&settings),
        backlog,
        Arc::new(KvProtection::new(kv, settings.worker_state_prefix.clone())),
        Arc::new(HttpWorkerPool::new(
            orchestrator_url,
            Duration::from_secs(settings.default_timeout),
        )),
    );

    tracing::info!(
        queue = %settings.scaled_queue,
        min = settings.min_workers,
        max = settings.max_workers,
        target = settings.target_messages_per_worker,
        once = args.once,
        "autoscaler starting"
    );

    loop {
        let outcome = scaler.run_once().await;
        tracing::debug!(?outcome, "autoscale check finished");
        if args.once {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
