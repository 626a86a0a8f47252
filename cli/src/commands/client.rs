//! `toolgear client`: wait for a collector and record its data

use crate::{output, report};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use toolgear_client::metrics::encode_metrics;
use toolgear_client::{run_client, ClientConfig, OverlapPolicy, RunOptions};
use toolgear_shared::protocol::ChannelMode;
use toolgear_shared::utils::parse_duration;

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address (unix:/path or tcp:host:port)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Heartbeat interval (e.g. 500ms, 5s)
    #[arg(long)]
    pub heartbeat: Option<String>,

    /// Line-range overlap handling: last-wins, first-wins or reject
    #[arg(long, value_parser = parse_overlap)]
    pub overlap: Option<OverlapPolicy>,

    /// Merge this snapshot before the collector connects (repeatable)
    #[arg(long = "load")]
    pub preload: Vec<PathBuf>,

    /// Write the database here when the session ends (.json or .mdb)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Use background I/O threads instead of polling
    #[arg(long)]
    pub threaded: bool,

    /// Rows per table in the final report
    #[arg(long, default_value = "10")]
    pub top: usize,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    pub dump_metrics: bool,
}

fn parse_overlap(s: &str) -> Result<OverlapPolicy, String> {
    match s {
        "last-wins" | "last_wins" => Ok(OverlapPolicy::LastWins),
        "first-wins" | "first_wins" => Ok(OverlapPolicy::FirstWins),
        "reject" => Ok(OverlapPolicy::Reject),
        other => Err(format!("unknown overlap policy: {}", other)),
    }
}

fn build_config(args: &ClientArgs) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(addr) = &args.listen {
        config.listen_addr = addr.clone();
    }
    if let Some(heartbeat) = &args.heartbeat {
        config.heartbeat_interval_ms = parse_duration(heartbeat)?.as_millis() as u64;
    }
    if let Some(policy) = args.overlap {
        config.overlap_policy = policy;
    }
    if args.threaded {
        config.channel_mode = ChannelMode::Threaded;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = build_config(&args)?;
    output::info(&format!("Waiting for a collector on {}", config.listen_addr));

    let options = RunOptions {
        preload: args.preload.clone(),
        snapshot_out: args.output.clone(),
    };
    let mut outcome = run_client(config, options).await?;

    if let Some(info) = &outcome.collector {
        output::info(&format!("Collector: {} (pid {})", info.program, info.pid));
    }
    if let Some(summary) = &outcome.instrumented {
        let msg = format!(
            "Instrumented {} points with {} actions",
            summary.points, summary.actions
        );
        if summary.failures > 0 {
            output::warning(&format!("{} ({} failures)", msg, summary.failures));
        } else {
            output::success(&msg);
        }
    }

    for summary in report::summarize_all(&mut outcome.db)? {
        output::print_summary(&summary, args.top, false);
    }
    for (key, count) in outcome.db.diagnostics().entries() {
        output::warning(&format!("{} (x{})", key, count));
    }
    if let Some(path) = &args.output {
        output::success(&format!("Snapshot written to {}", path.display()));
    }
    output::success(&format!("Session ended: {}", outcome.reason));

    if args.dump_metrics {
        print!("{}", encode_metrics()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overlap() {
        assert_eq!(parse_overlap("reject").unwrap(), OverlapPolicy::Reject);
        assert_eq!(parse_overlap("first-wins").unwrap(), OverlapPolicy::FirstWins);
        assert!(parse_overlap("newest").is_err());
    }
}
