//! Toolgear collector library
//!
//! The collector runs beside the target program. It describes the
//! program's structure to the client, installs probes on request, and
//! streams the values they produce back as database commands.

pub mod config;
pub mod dispatch;
pub mod instrument;
pub mod registry;
pub mod retry;
pub mod schema;

pub use config::CollectorConfig;
pub use dispatch::{Collector, Flow};

use anyhow::{Context, Result};
use instrument::{FsSourceProvider, Program, RecordingBackend, StaticProgram};
use retry::{retry_with_backoff, RetryPolicy};
use tracing::info;

fn load_program(config: &CollectorConfig) -> Result<StaticProgram> {
    match &config.program_manifest {
        Some(path) => StaticProgram::load(path),
        None => Ok(StaticProgram::empty("unknown")),
    }
}

/// Connect to the client and serve it until either side quits.
pub async fn run_collector(config: CollectorConfig) -> Result<()> {
    config.validate()?;
    let program = load_program(&config)?;
    let specs = config.location_specs()?;
    let endpoint = config.endpoint()?;
    info!(
        "collector for {} ({} points), client at {}",
        program.name(),
        program.point_count(),
        endpoint
    );

    let policy = RetryPolicy::new(config.connect_attempts, config.connect_backoff());
    let (mode, max_frame) = (config.channel_mode, config.max_frame_bytes);
    let channel = retry_with_backoff("connect to client", &policy, || {
        let endpoint = endpoint.clone();
        async move {
            tokio::task::spawn_blocking(move || endpoint.connect(mode, max_frame))
                .await
                .context("connect task panicked")?
                .map_err(anyhow::Error::from)
        }
    })
    .await
    .with_context(|| format!("Failed to connect to client at {}", endpoint))?;

    let backend = RecordingBackend::with_script(program.script().to_vec());
    let types = schema::builtin_action_types()?;
    let mut collector = Collector::new(
        channel,
        Box::new(program),
        Box::new(FsSourceProvider::new(config.source_paths.clone())),
        Box::new(backend),
        types,
    )
    .with_heartbeat_timeout(config.heartbeat_timeout())
    .with_poll_interval(config.poll_interval());

    let reason = tokio::task::spawn_blocking(move || collector.run(&specs))
        .await
        .context("collector loop panicked")??;
    info!("collector finished: {}", reason);
    Ok(())
}
