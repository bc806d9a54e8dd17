//! qbit node binary.
//!
//! The consensus and storage core behind a small CLI. Peer networking and
//! RPC are separate layers; this binary opens the node, optionally mines a
//! number of regtest blocks through the template path, and reports status.

use anyhow::{bail, Context, Result};
use clap::Parser;
use qbit_node::{Node, NodeConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// qbit blockchain node core.
#[derive(Parser, Debug)]
#[command(name = "qbit-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "qbit.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file).
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network to run on (mainnet, testnet, regtest).
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// Mine this many blocks through the template path, then exit.
    /// Regtest only.
    #[arg(long, default_value = "0")]
    generate: u32,

    /// Hex-encoded coinbase destination script for --generate.
    #[arg(long)]
    mining_destination: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting qbit node v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        NodeConfig::load(&args.config, &args.network).context("failed to load configuration")?;
    config.network = args.network.clone();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(ref dest) = args.mining_destination {
        config.mining.destination_script = Some(dest.clone());
    }

    let node = Node::open(config).context("failed to open node")?;
    let status = node.status();
    info!(
        network = status.network,
        height = status.height,
        tip = %status.tip,
        "node ready"
    );

    if args.generate > 0 {
        if node.config().network != "regtest" {
            bail!("--generate is a regtest facility");
        }
        let destination = node
            .config()
            .mining
            .destination_script
            .as_deref()
            .map(hex::decode)
            .transpose()
            .context("mining destination is not valid hex")?
            .unwrap_or_else(|| vec![0x51]);

        for i in 0..args.generate {
            let template = node.get_block_template(&destination, i)?;
            let block = node
                .templates()
                .solve(&template, node.config().mining.max_solve_attempts)?;
            let result = node.templates().submit_block(block);
            if !result.is_accepted() {
                bail!("generated block rejected: {result:?}");
            }
        }
        let status = node.status();
        info!(height = status.height, tip = %status.tip, "generation complete");
        println!("{} {}", status.height, status.tip);
    }

    Ok(())
}
