mod cache;
mod gossip;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use flock_protocol::{HttpLedger, HttpStore, KvStore, SwarmLedger};

use cache::{CacheConfig, SwarmCache};

#[derive(Parser)]
#[command(name = "flock-server", about = "Flock swarm leaderboard and gossip API")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8000", env = "FLOCK_LISTEN")]
    listen: String,

    /// Store gateway URL
    #[arg(long, env = "FLOCK_STORE")]
    store: String,

    /// Auth token for the store gateway
    #[arg(long, env = "FLOCK_TOKEN", default_value = "")]
    token: String,

    /// Ledger proxy URL; when set, the round/stage pointer is read from it
    #[arg(long, env = "FLOCK_LEDGER")]
    ledger: Option<String>,

    /// Store poll interval in seconds
    #[arg(long, default_value = "10")]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    tracing::info!(listen = %cli.listen, store = %cli.store, "Starting flock server");

    let store: Arc<dyn KvStore> = Arc::new(HttpStore::new(&cli.store, &cli.token));
    let ledger: Option<Arc<dyn SwarmLedger>> = cli
        .ledger
        .as_deref()
        .map(|url| Arc::new(HttpLedger::new(url, &cli.token)) as Arc<dyn SwarmLedger>);

    let config = CacheConfig {
        poll_interval: Duration::from_secs(cli.poll_interval),
        ..CacheConfig::default()
    };
    let cache = Arc::new(SwarmCache::new(store, ledger, config));

    // The poller owns the snapshot; handlers only ever read it.
    let poller = cache.clone();
    tokio::spawn(async move {
        loop {
            tracing::debug!("pulling latest store data");
            poller.poll().await;
            tokio::time::sleep(poller.poll_interval()).await;
        }
    });

    let app = routes::create_router(cache).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    tracing::info!("Listening on {}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down");
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
