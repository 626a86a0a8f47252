//! Toolgear client
//!
//! Waits for a collector, records what it reports, and optionally writes
//! the resulting program database as a snapshot.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use toolgear_client::metrics::encode_metrics;
use toolgear_client::{run_client, ClientConfig, RunOptions};
use toolgear_shared::protocol::ChannelMode;
use toolgear_shared::types::program::StatKind;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "toolgear-client")]
#[command(about = "Receive instrumentation data from a toolgear collector", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (unix:/path or tcp:host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Merge this snapshot before the collector connects (repeatable)
    #[arg(long = "load")]
    preload: Vec<PathBuf>,

    /// Write the database here when the session ends (.json or .mdb)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Use background I/O threads instead of polling
    #[arg(long)]
    threaded: bool,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    dump_metrics: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose)?;

    info!("Starting toolgear client");

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.listen {
        config.listen_addr = addr;
    }
    if args.threaded {
        config.channel_mode = ChannelMode::Threaded;
    }

    let options = RunOptions {
        preload: args.preload,
        snapshot_out: args.output,
    };
    let mut outcome = run_client(config, options).await?;

    if let Some(summary) = outcome.instrumented {
        info!(
            "Collector instrumented {} points ({} failures)",
            summary.points, summary.failures
        );
    }
    let tags: Vec<String> = outcome
        .db
        .data_attrs()
        .iter()
        .map(|a| a.tag.clone())
        .collect();
    for tag in tags {
        let total = outcome.db.app_data_stat(&tag, StatKind::Sum, StatKind::Sum)?;
        info!("{}: {}", tag, total.unwrap_or(0.0));
    }
    info!("Session ended: {}", outcome.reason);

    if args.dump_metrics {
        print!("{}", encode_metrics()?);
    }
    Ok(())
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
