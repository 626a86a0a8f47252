//! `toolgear collect`: instrument a program and stream its data to a client

use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use toolgear_collector::config::InstrumentRule;
use toolgear_collector::{run_collector, CollectorConfig};
use toolgear_shared::protocol::ChannelMode;
use toolgear_shared::utils::parse_duration;

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Client address (unix:/path or tcp:host:port)
    #[arg(short = 'a', long, env = "TOOLGEAR_CLIENT_ADDR")]
    pub client_addr: Option<String>,

    /// Program manifest describing functions and points
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// Extra source search directory (repeatable)
    #[arg(short = 'I', long = "source-path")]
    pub source_paths: Vec<PathBuf>,

    /// Startup instrumentation as PATTERN=ACTION (repeatable)
    #[arg(long = "instrument", value_parser = parse_rule)]
    pub instrument: Vec<InstrumentRule>,

    /// Quit when the client stays silent this long (0 = never)
    #[arg(long)]
    pub heartbeat_timeout: Option<String>,

    /// Use background I/O threads instead of polling
    #[arg(long)]
    pub threaded: bool,
}

/// `^main$=count` instruments every point of `main` with the count action.
fn parse_rule(s: &str) -> Result<InstrumentRule, String> {
    let (pattern, action) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected PATTERN=ACTION, got {}", s))?;
    if pattern.is_empty() || action.is_empty() {
        return Err(format!("expected PATTERN=ACTION, got {}", s));
    }
    Ok(InstrumentRule {
        pattern: pattern.to_string(),
        kind: "*".to_string(),
        location: "*".to_string(),
        action: action.to_string(),
    })
}

fn build_config(args: &CollectArgs) -> Result<CollectorConfig> {
    let mut config = match &args.config {
        Some(path) => CollectorConfig::load(path)?,
        None => CollectorConfig::default(),
    };
    if let Some(addr) = &args.client_addr {
        config.client_addr = addr.clone();
    }
    if let Some(manifest) = &args.manifest {
        config.program_manifest = Some(manifest.clone());
    }
    config.source_paths.extend(args.source_paths.iter().cloned());
    config.instrument.extend(args.instrument.iter().cloned());
    if let Some(timeout) = &args.heartbeat_timeout {
        config.heartbeat_timeout_secs = parse_duration(timeout)
            .with_context(|| format!("Invalid heartbeat timeout: {}", timeout))?
            .as_secs();
    }
    if args.threaded {
        config.channel_mode = ChannelMode::Threaded;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(args: CollectArgs) -> Result<()> {
    let config = build_config(&args)?;
    output::info(&format!("Connecting to client at {}", config.client_addr));
    run_collector(config).await?;
    output::success("Collector finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule() {
        let rule = parse_rule("^a=b$=count").unwrap();
        assert_eq!(rule.pattern, "^a=b$");
        assert_eq!(rule.action, "count");
        assert_eq!(rule.kind, "*");
        assert!(parse_rule("count").is_err());
        assert!(parse_rule("^main$=").is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.toml");
        std::fs::write(&path, "client_addr = \"tcp:127.0.0.1:9000\"\nheartbeat_timeout_secs = 5\n")
            .unwrap();

        let args = CollectArgs {
            config: Some(path),
            client_addr: None,
            manifest: None,
            source_paths: vec![PathBuf::from("/src")],
            instrument: vec![parse_rule("^main$=count").unwrap()],
            heartbeat_timeout: Some("2m".into()),
            threaded: true,
        };
        let config = build_config(&args).unwrap();
        assert_eq!(config.client_addr, "tcp:127.0.0.1:9000");
        assert_eq!(config.heartbeat_timeout_secs, 120);
        assert_eq!(config.channel_mode, ChannelMode::Threaded);
        assert_eq!(config.instrument.len(), 1);
        assert_eq!(config.source_paths, vec![PathBuf::from("/src")]);
    }
}
