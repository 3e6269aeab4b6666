//! Gridlink CLI - Inspect and exercise cluster connections
//!
//! Lists the candidate addresses a configuration produces and opens framed
//! connections to cluster members.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gridlink_client::{ClientNetworkConfig, ClusterConnector};
use gridlink_transport::{
    ChannelFrameHandler, Handlers, PrefixHandler, ShutdownEvent, ShutdownHandler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Gridlink - Cluster client connection layer
#[derive(Parser, Debug)]
#[command(name = "gridlink")]
#[command(about = "Gridlink - Cluster client connection layer")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Client network configuration (YAML)
    #[arg(short, long, global = true, env = "GRIDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Seed address, overrides the configured list (repeatable)
    #[arg(short, long, global = true)]
    address: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the candidate addresses for the configuration
    Candidates {
        /// Refresh the address source before listing
        #[arg(long)]
        refresh: bool,
    },

    /// Connect to the cluster and log received frames until Ctrl+C
    #[command(long_about = r#"
Connect to the first reachable cluster member, write an optional protocol
prefix and log every length-prefixed frame received until Ctrl+C.

EXAMPLES:
  # Connect using a config file
  gridlink --config client.yaml connect --prefix CP2

  # Connect to an explicit member, expecting a 3 byte greeting
  gridlink --address 10.0.0.1:5701 connect --prefix-length 3

ENVIRONMENT VARIABLES:
  GRIDLINK_CONFIG        Path to the client network configuration
  RUST_LOG               Log filter (overrides --verbose)
    "#)]
    Connect {
        /// Protocol prefix written right after the connection is established
        #[arg(long)]
        prefix: Option<String>,

        /// Length of the prefix expected from the member
        #[arg(long, default_value = "0")]
        prefix_length: usize,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>, addresses: &[String]) -> Result<ClientNetworkConfig> {
    let mut config = match path {
        Some(path) => ClientNetworkConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientNetworkConfig::builder()
            .build()
            .context("Failed to build default config")?,
    };

    if !addresses.is_empty() {
        config.addresses = addresses.to_vec();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

struct LogPrefix;

#[async_trait]
impl PrefixHandler for LogPrefix {
    async fn on_prefix_bytes(&self, prefix: &[u8]) -> anyhow::Result<()> {
        info!("Member prefix: {:?}", String::from_utf8_lossy(prefix));
        Ok(())
    }
}

struct LogShutdown;

#[async_trait]
impl ShutdownHandler for LogShutdown {
    async fn on_shutdown(&self, event: ShutdownEvent) {
        match event.error {
            Some(e) => warn!("[conn-{}] Closed with error: {:#}", event.connection_id, e),
            None => info!("[conn-{}] Closed", event.connection_id),
        }
    }
}

async fn list_candidates(config: ClientNetworkConfig, refresh: bool) -> Result<()> {
    let connector = ClusterConnector::new(config).context("Failed to create connector")?;
    let candidates = connector.provider().addresses(refresh).await;

    if candidates.is_empty() {
        warn!("No candidate addresses");
        return Ok(());
    }

    for address in &candidates.primary {
        println!("primary    {}", address);
    }
    for address in &candidates.secondary {
        println!("secondary  {}", address);
    }
    Ok(())
}

async fn connect(
    config: ClientNetworkConfig,
    prefix: Option<String>,
    prefix_length: usize,
) -> Result<()> {
    let connector = ClusterConnector::new(config)
        .context("Failed to create connector")?
        .with_prefix_length(prefix_length);

    let (handler, mut frames) = ChannelFrameHandler::channel(64);
    let handlers = Handlers::new(Arc::new(handler))
        .with_prefix(Arc::new(LogPrefix))
        .with_shutdown(Arc::new(LogShutdown));

    let connection = connector
        .connect_to_cluster(handlers)
        .await
        .context("Failed to connect to cluster")?;

    if let Some(prefix) = prefix {
        if !connection.send(prefix.as_bytes()).await {
            anyhow::bail!("Connection closed before the prefix was written");
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => info!("[conn-{}] Frame ({} bytes)", connection.id(), frame.len()),
                None => break,
            },
            _ = connection.closed() => break,
        }
    }

    connection.close().await;
    let stats = connection.stats();
    info!(
        "Sent {} bytes, received {} bytes in {}s",
        stats.bytes_sent, stats.bytes_received, stats.uptime_secs
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_ref(), &cli.address)?;

    let result = match cli.command {
        Commands::Candidates { refresh } => list_candidates(config, refresh).await,
        Commands::Connect {
            prefix,
            prefix_length,
        } => connect(config, prefix, prefix_length).await,
    };

    if let Err(ref e) = result {
        error!("{:#}", e);
    }
    result
}
