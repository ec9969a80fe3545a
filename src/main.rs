use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kadnet::{DhtConfig, Server};

/// How often the state file is rewritten while running.
const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "kadnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:8468")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// State file to restore from and save to
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    k: Option<usize>,

    #[arg(long)]
    alpha: Option<usize>,

    #[arg(short, long, default_value = "300")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => DhtConfig::from_json_file(path)?,
        None => DhtConfig::default(),
    };
    if let Some(k) = args.k {
        config.k = k;
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }

    let server = match &args.state {
        Some(path) if path.exists() => Server::load_state(path, args.bind, config).await?,
        _ => Server::listen(args.bind, config).await?,
    };
    info!("Node identity: {}", server.node_id());

    if !args.bootstrap.is_empty() {
        match server.bootstrap(&args.bootstrap).await {
            Ok(found) => info!(found = found.len(), "Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    if let Some(path) = &args.state {
        server.save_state_regularly(path.clone(), STATE_SAVE_INTERVAL);
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = server.stats().await;
                info!(
                    contacts = stats.contacts,
                    buckets = stats.buckets,
                    stored_keys = stats.stored_keys,
                    "node stats"
                );
            }
        }
    }

    if let Some(path) = &args.state
        && let Err(e) = server.save_state(path).await
    {
        warn!(error = %e, "failed to save state on exit");
    }
    server.shutdown().await;

    Ok(())
}
