//! Tollgate node entry point.
//!
//! Starts the payment and settlement engine with configuration from a TOML
//! file or defaults.

// Accessors on the node are used by tests and embedding code.
#![allow(dead_code)]

mod config;
mod node;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::TollgateConfig;
use node::TollgateNode;

/// Tollgate node
#[derive(Parser, Debug)]
#[command(name = "tollgate-node", version, about = "Tollgate payment and settlement node")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "tollgate.toml")]
    config: PathBuf,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

fn init_tracing(config: &TollgateConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.logging.is_json() {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init {
        let config = TollgateConfig::default();
        config.save(&args.config)?;
        println!("wrote default config to {}", args.config.display());
        return Ok(());
    }

    let mut config = TollgateConfig::load(&args.config)?;
    if let Some(ref data_dir) = args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config);
    tracing::info!("Tollgate node v{}", env!("CARGO_PKG_VERSION"));

    let mut node = TollgateNode::new(config)?;
    node.start()?;

    let chain_id = node.addresses().active_chain_id();
    match node.service().transactor_fees(chain_id).await {
        Ok(fees) => tracing::info!(
            chain_id,
            registration = %fees.registration,
            settlement = %fees.settlement,
            "transactor fees"
        ),
        Err(e) => tracing::warn!(chain_id, error = %e, "transactor fees unavailable"),
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
    }

    node.shutdown().await?;
    tracing::info!("Tollgate node exited cleanly");
    Ok(())
}
