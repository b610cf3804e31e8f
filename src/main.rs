use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use veilmesh::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "veilmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Peers to join through (IP:PORT).
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<SocketAddr>,

    /// Identity file; created on first run.
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Seconds between peer-count log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        bind_addr: args.bind,
        identity_path: args.identity.clone(),
        ..NodeConfig::default()
    };
    let node = Node::bind(config).await?;
    info!("node id: {} (rank {})", node.id(), node.rank());

    for peer in &args.bootstrap {
        info!("bootstrapping from {peer}");
        match node.bootstrap(*peer).await {
            Ok(()) => info!("bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                node.shutdown().await;
                break;
            }
            _ = interval.tick() => {
                match node.find_nodes_near(node.id(), 20, None).await {
                    Ok(peers) => info!(known_peers = peers.len(), "status"),
                    Err(e) => warn!(error = %e, "status query failed"),
                }
            }
        }
    }

    Ok(())
}
