//! CLI for Toolgear
//!
//! One binary for every role:
//! - client: wait for a collector and record its data
//! - collect: run a collector against a program manifest
//! - snapshot: merge, diff and summarize database snapshots

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;
mod report;

#[derive(Parser)]
#[command(name = "toolgear")]
#[command(about = "Toolgear - distributed program instrumentation", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a collector and record what it reports
    Client(commands::client::ClientArgs),

    /// Instrument a program and send its data to a client
    Collect(commands::collect::CollectArgs),

    /// Work with saved database snapshots
    Snapshot(commands::snapshot::SnapshotArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Client(args) => commands::client::run(args).await,
        Commands::Collect(args) => commands::collect::run(args).await,
        Commands::Snapshot(args) => commands::snapshot::run(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
