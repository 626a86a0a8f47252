//! Toolgear collector
//!
//! Runs beside the target program and serves probe data to a client.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use toolgear_collector::{run_collector, CollectorConfig};
use toolgear_shared::protocol::ChannelMode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "toolgear-collector")]
#[command(about = "Instrument a program and stream its data to a toolgear client", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client address (unix:/path or tcp:host:port)
    #[arg(short = 'a', long, env = "TOOLGEAR_CLIENT_ADDR")]
    client_addr: Option<String>,

    /// Program manifest describing functions and points
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Extra source search directory (repeatable)
    #[arg(short = 'I', long = "source-path")]
    source_paths: Vec<PathBuf>,

    /// Use background I/O threads instead of polling
    #[arg(long)]
    threaded: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose)?;

    info!("Starting toolgear collector");

    let mut config = match &args.config {
        Some(path) => CollectorConfig::load(path)?,
        None => CollectorConfig::default(),
    };
    if let Some(addr) = args.client_addr {
        config.client_addr = addr;
    }
    if let Some(manifest) = args.manifest {
        config.program_manifest = Some(manifest);
    }
    config.source_paths.extend(args.source_paths);
    if args.threaded {
        config.channel_mode = ChannelMode::Threaded;
    }

    run_collector(config).await
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}
