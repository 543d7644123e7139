//! WolfRing - membership and range replication node
//!
//! Runs one replica over TCP with an in-memory store and a private
//! consensus log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfring::config::WolfRingConfig;
use wolfring::network::{TcpServer, TcpTransport};
use wolfring::node::{self, LogPort, Node, NodeDeps};
use wolfring::placement::StaticPlacement;
use wolfring::router::LogMonitor;
use wolfring::store::MemStore;

/// WolfRing - membership and range replication node
#[derive(Parser)]
#[command(name = "wolfring")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfring.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Install a bootstrap view of this node and its peers
        #[arg(long)]
        bootstrap: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfring.toml")]
        output: PathBuf,

        /// Node identity (host:port)
        #[arg(long, default_value = "127.0.0.1:7654")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bootstrap } => {
            let config = WolfRingConfig::from_file(&cli.config)
                .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
            let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
            init_logging(level, &config.logging.format);
            run_start(config, bootstrap).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    let compact = format == "compact";

    tracing_subscriber::registry()
        .with(env_filter)
        .with((!compact).then(tracing_subscriber::fmt::layer))
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .init();
}

/// Start the node and run until Ctrl-C
async fn run_start(config: WolfRingConfig, bootstrap: bool) -> anyhow::Result<()> {
    tracing::info!("Starting WolfRing node {}", config.node.id);

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let server_cancel = CancellationToken::new();
    let server = TcpServer::new(config.node.bind_address.clone(), inbound_tx);
    let server_task = tokio::spawn(server.serve(server_cancel.clone()));

    let deps = NodeDeps {
        store: Arc::new(MemStore::new()),
        placement: Arc::new(StaticPlacement::new()),
        monitor: Arc::new(LogMonitor),
        transport: Arc::new(TcpTransport::new(config.connect_timeout())),
        log: LogPort::Local,
    };

    let reconfigure = if bootstrap || config.cluster.bootstrap {
        Some(node::bootstrap_reconfigure(&config)?)
    } else {
        None
    };

    let handle = Node::spawn(&config, deps, inbound_rx, reconfigure)
        .await
        .context("failed to start node")?;

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("Received shutdown signal");

    handle.shutdown().await;
    server_cancel.cancel();
    match server_task.await {
        Ok(result) => result.context("network server failed")?,
        Err(e) => tracing::warn!("Network server task failed: {}", e),
    }

    tracing::info!("WolfRing node stopped");
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config = WolfRingConfig::sample(&node_id, &node_id);
    let content = format!(
        "# WolfRing Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {:?}", output))?;
    println!("Configuration written to {:?}", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfRingConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
            println!("  Quorum Size: {}", config.quorum_size());
            println!("  Detection Timeout: {:?}", config.detector.detection_timeout());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
