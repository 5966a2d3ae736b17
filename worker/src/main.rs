mod driver;
mod dry_run;
mod merge;
mod publish;
mod stages;
mod winners;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use flock_protocol::{HttpLedger, HttpStore, KvStore, NodeState, NullLedger, SwarmLedger};

use driver::{DriverConfig, PointerSource, SwarmDriver};
use dry_run::DryRunEngine;
use stages::{build_pipeline, StageOptions};

#[derive(Parser)]
#[command(name = "flock-worker", about = "Flock swarm training node")]
struct Cli {
    /// Store gateway URL (e.g. https://store.example.com:7400)
    #[arg(long, env = "FLOCK_STORE")]
    store: String,

    /// Auth token for the store gateway
    #[arg(long, env = "FLOCK_TOKEN", default_value = "")]
    token: String,

    /// Node identity; generated when omitted
    #[arg(long, env = "FLOCK_IDENTITY")]
    identity: Option<String>,

    /// Act as the round coordinator
    #[arg(long)]
    coordinator: bool,

    /// Ledger proxy URL; winners are only logged without one
    #[arg(long, env = "FLOCK_LEDGER")]
    ledger: Option<String>,

    /// Read the round/stage pointer from the ledger instead of the store
    #[arg(long)]
    pointer_from_ledger: bool,

    /// Path to a JSON array of initial question records
    #[arg(long)]
    dataset: Option<String>,

    #[arg(long, default_value = "100")]
    max_rounds: u64,

    /// Overall training timeout in seconds
    #[arg(long, default_value = "345600")]
    train_timeout: u64,

    /// Poll interval in seconds for pointer and reward checks
    #[arg(long, default_value = "5")]
    check_interval: u64,

    /// Soft cap on peer samples pulled per merge
    #[arg(long, default_value = "200")]
    sample_limit: usize,

    /// TTL in seconds for everything this node publishes
    #[arg(long, default_value = "14400")]
    out_ttl: u64,
}

/// Built-in questions for swarms running without a dataset on disk.
fn builtin_dataset() -> Vec<Value> {
    serde_json::json!([
        {"question": "What is 6 x 7?", "answer": "42"},
        {"question": "A train travels 120 km in 2 hours. How many km/h is that?", "answer": "60"},
        {"question": "What is the sum of the first 10 positive integers?", "answer": "55"},
        {"question": "How many minutes are in 4.5 hours?", "answer": "270"},
    ])
    .as_array()
    .cloned()
    .unwrap_or_default()
}

async fn load_dataset(path: Option<&str>) -> Result<Vec<Value>> {
    let Some(path) = path else {
        return Ok(builtin_dataset());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read dataset {path}"))?;
    let questions: Vec<Value> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse dataset {path}"))?;
    Ok(questions)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let identity = cli
        .identity
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::info!(
        identity = %identity,
        store = %cli.store,
        coordinator = cli.coordinator,
        "Starting flock worker"
    );

    let store: Arc<dyn KvStore> = Arc::new(HttpStore::new(&cli.store, &cli.token));
    let ledger: Arc<dyn SwarmLedger> = match &cli.ledger {
        Some(url) => Arc::new(HttpLedger::new(url, &cli.token)),
        None => Arc::new(NullLedger),
    };

    if cli.ledger.is_some() {
        match ledger.bootstrap_peers().await {
            Ok(peers) => tracing::info!(peers = ?peers, "🐝 joining swarm"),
            Err(e) => tracing::warn!(error = %e, "could not fetch bootstrap peers"),
        }
    }

    let mut node = if cli.coordinator {
        NodeState::coordinator(identity)
    } else {
        NodeState::new(identity)
    };
    node.out_ttl = Duration::from_secs(cli.out_ttl);
    let node = Arc::new(RwLock::new(node));

    let questions = load_dataset(cli.dataset.as_deref()).await?;
    let stage_opts = StageOptions {
        sample_limit: cli.sample_limit,
        check_interval: Duration::from_secs(cli.check_interval),
        wait_timeout: Duration::from_secs(cli.check_interval * 2),
    };
    let merge_opts = stage_opts.merge_options();

    let mut pipeline = build_pipeline(
        store.clone(),
        node.clone(),
        questions.clone(),
        questions,
        stage_opts,
    );
    pipeline.max_rounds = cli.max_rounds;
    pipeline.train_timeout = Duration::from_secs(cli.train_timeout);

    let config = DriverConfig {
        check_interval: Duration::from_secs(cli.check_interval),
        pointer_source: if cli.pointer_from_ledger {
            PointerSource::Ledger
        } else {
            PointerSource::Store
        },
        ..DriverConfig::default()
    };

    let driver = SwarmDriver::new(
        store,
        node,
        pipeline,
        Arc::new(DryRunEngine),
        ledger,
        merge_opts,
        config,
    );

    tokio::select! {
        _ = driver.run() => {
            tracing::info!("training run finished");
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down gracefully");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
