//! # Worker Binary Entry Point
//!
//! Thin wrapper that runs one filter worker.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin worker -- --config config/worker1.toml
//! ```
//!
//! The worker will:
//! 1. Load configuration from the specified TOML file
//! 2. Dial the master and register its advertised address
//! 3. Serve filter jobs (light or heavy pipeline per config) until Ctrl-C

use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use std::io::Write;
use tokio::sync::watch;

use filter_farm::common::config::WorkerConfig;
use filter_farm::worker::WorkerNode;

/// Command-line arguments for the worker binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the worker configuration file (TOML format)
    #[arg(short, long)]
    config: String,
}

fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config = WorkerConfig::from_file(&args.config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = WorkerNode::new(config);

    tokio::select! {
        result = node.run(shutdown_rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("🔌 Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}
