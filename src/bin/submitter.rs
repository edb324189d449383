//! # Submitter Binary Entry Point
//!
//! Pushes image files through the cluster and writes the processed results
//! back to disk.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin submitter -- --master 127.0.0.1:9000 \
//!     --filter-size 5 --output-dir out photo1.png photo2.jpg
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::watch;

use filter_farm::submitter::{JobSpec, Submitter};

/// Command-line arguments for the submitter binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of the master, e.g. 127.0.0.1:9000
    #[arg(short, long)]
    master: String,

    /// Gaussian kernel size applied by light-mode workers. Must be odd.
    #[arg(short, long, default_value_t = 5)]
    filter_size: u32,

    /// Directory the processed images are written into
    #[arg(short, long, default_value = "out")]
    output_dir: PathBuf,

    /// Image files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,
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

fn load_job(path: &PathBuf, filter_size: u32) -> anyhow::Result<JobSpec> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let format = image::guess_format(&bytes)
        .map(|f| format!("{:?}", f).to_lowercase())
        .unwrap_or_else(|_| "unknown".to_string());
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("{:?} is not a decodable image", path))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    Ok(JobSpec {
        file_name,
        width: decoded.width(),
        height: decoded.height(),
        format,
        filter_size,
        image_data: bytes,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    if args.filter_size == 0 || args.filter_size % 2 == 0 {
        bail!("--filter-size must be odd, got {}", args.filter_size);
    }

    let jobs: Vec<JobSpec> = args
        .files
        .iter()
        .map(|path| load_job(path, args.filter_size))
        .collect::<anyhow::Result<_>>()?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {:?}", args.output_dir))?;

    info!(
        "🚀 Submitting {} job(s) to master at {}",
        jobs.len(),
        args.master
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let submitter = Submitter::new(args.master);
    let output_dir = args.output_dir.clone();

    let summary = submitter
        .submit_batch(jobs, shutdown_rx, |result| {
            let target = output_dir.join(format!("processed_{}", result.file_name));
            std::fs::write(&target, &result.image_data)
                .with_context(|| format!("failed to write {:?}", target))?;
            info!("💾 Wrote {:?}", target);
            Ok(())
        })
        .await?;

    summary.log();
    Ok(())
}
