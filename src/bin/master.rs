//! # Master Binary Entry Point
//!
//! Thin wrapper that runs the dispatch coordinator.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin master -- --config config/master.toml
//! ```
//!
//! The master will:
//! 1. Load configuration from the specified TOML file
//! 2. Bind the listening port for workers and submitters alike
//! 3. Route every image job to a free worker under the configured policy
//! 4. Run until Ctrl-C

use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use filter_farm::common::config::MasterConfig;
use filter_farm::common::connection;
use filter_farm::master::Dispatcher;

/// Command-line arguments for the master binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the master configuration file (TOML format)
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
    let config = MasterConfig::from_file(&args.config)?;

    info!(
        "🚀 Master starting on port {} with policy {:?}",
        config.master.port, config.master.policy
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(config.dispatch.event_queue_capacity);

    let listener = TcpListener::bind(("0.0.0.0", config.master.port)).await?;
    let dispatcher = Arc::new(Dispatcher::new(config.master.policy));

    tokio::spawn(connection::serve(listener, event_tx, shutdown_rx));
    let dispatch_loop = tokio::spawn(dispatcher.clone().run(event_rx));

    tokio::signal::ctrl_c().await?;
    info!("🔌 Ctrl-C received, shutting down");
    let _ = shutdown_tx.send(true);
    dispatch_loop.abort();

    let (received, completed) = dispatcher.counters().await;
    info!(
        "📊 Final counters: {} received, {} completed",
        received, completed
    );

    Ok(())
}
