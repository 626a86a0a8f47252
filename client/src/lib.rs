//! Toolgear client library
//!
//! The client listens for one collector, keeps everything it reports in a
//! [`db::ProgramDatabase`] with roll-up statistics, and can persist or merge
//! database snapshots.

pub mod config;
pub mod db;
pub mod diagnostics;
pub mod dispatch;
pub mod fetch;
pub mod metrics;
pub mod stats;

pub use config::{ClientConfig, OverlapPolicy};
pub use db::ProgramDatabase;
pub use dispatch::{ClientSession, SessionHandle, SessionOutcome};

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

/// Per-run options that are not part of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Snapshots merged into the database before the collector connects.
    pub preload: Vec<PathBuf>,
    /// Where to write the database when the session ends.
    pub snapshot_out: Option<PathBuf>,
}

/// Accept one collector and serve it until either side quits.
pub async fn run_client(config: ClientConfig, options: RunOptions) -> Result<SessionOutcome> {
    config.validate()?;

    let mut db = ProgramDatabase::new(config.overlap_policy);
    for path in &options.preload {
        let report = db
            .add_snapshot(path, 1)
            .with_context(|| format!("Failed to merge snapshot {}", path.display()))?;
        info!("Preloaded {} ({} values)", path.display(), report.values);
    }

    let endpoint = config.endpoint()?;
    let listener = endpoint.bind().context("Failed to bind listen address")?;
    info!("Waiting for a collector on {}", endpoint);

    let (mode, max_frame) = (config.channel_mode, config.max_frame_bytes);
    let (channel, peer) = tokio::task::spawn_blocking(move || listener.accept(mode, max_frame))
        .await
        .context("Accept task panicked")?
        .context("Failed to accept collector")?;
    info!("Collector connected from {}", peer);

    let session = ClientSession::new(channel, db).with_heartbeat(config.heartbeat_interval());
    let handle = session.handle(config.fetch_progress_delay());

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = handle.quit("client interrupted");
        }
    });

    let outcome = tokio::task::spawn_blocking(move || session.run())
        .await
        .context("Session task panicked")?;
    interrupt.abort();
    let outcome = outcome?;

    if let Some(path) = &options.snapshot_out {
        if let Err(e) = outcome.db.write_snapshot(path) {
            warn!("Failed to write snapshot {}: {}", path.display(), e);
        }
    }
    Ok(outcome)
}
