//! Chorus Daemon
//!
//! Runs a hub or an edge node depending on configuration.

use anyhow::Result;
use chorus_daemon::{DaemonConfig, NodeRole, metrics};
use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Chorus Daemon - clustered voice server node
#[derive(Parser, Debug)]
#[command(name = "chorusd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "chorus.toml")]
    config: String,

    /// Extra files merged over the configuration, in order
    #[arg(long)]
    overlay: Vec<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Run as hub, overriding the configured role
    #[arg(long, conflicts_with = "edge")]
    hub: bool,

    /// Run as edge, overriding the configured role
    #[arg(long)]
    edge: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Chorus Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = DaemonConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);
    for overlay in &args.overlay {
        config.load_merge(overlay).await?;
        info!("Merged configuration from {}", overlay);
    }
    if args.hub {
        config.node.role = NodeRole::Hub;
    } else if args.edge {
        config.node.role = NodeRole::Edge;
    }

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);

    let outcome = chorus_daemon::run(config).await;

    // Cleanup
    metrics_handle.abort();

    outcome
}
