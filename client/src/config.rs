//! Client configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use toolgear_shared::protocol::{ChannelMode, Endpoint, DEFAULT_MAX_FRAME_BYTES};

/// Prefix for environment overrides, e.g. `TOOLGEAR_LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "TOOLGEAR";

/// What to do when a new function's line range covers lines already mapped
/// to another function of the same file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// The newer function takes the overlapping lines.
    #[default]
    LastWins,
    /// The existing mapping is kept.
    FirstWins,
    /// The insertion fails.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where collectors connect (unix:/path, tcp:host:port)
    pub listen_addr: String,

    /// Cooperative or background-thread transport
    pub channel_mode: ChannelMode,

    /// Interval between heartbeats sent to the collector
    pub heartbeat_interval_ms: u64,

    /// Largest frame payload accepted from a collector
    pub max_frame_bytes: usize,

    /// Function line-range overlap handling
    pub overlap_policy: OverlapPolicy,

    /// A file fetch slower than this is reported as in progress
    pub fetch_progress_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: "unix:/tmp/toolgear.sock".to_string(),
            channel_mode: ChannelMode::Cooperative,
            heartbeat_interval_ms: 5_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            overlap_policy: OverlapPolicy::LastWins,
            fetch_progress_delay_ms: 1_000,
        }
    }
}

impl ClientConfig {
    /// Defaults, then the optional TOML file, then `TOOLGEAR_*` variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let settings = builder.build().context("Failed to load client configuration")?;
        let config: ClientConfig = settings
            .try_deserialize()
            .context("Invalid client configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        self.listen_addr.parse()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn fetch_progress_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_progress_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.endpoint()?;

        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than 0");
        }

        if self.max_frame_bytes == 0 || self.max_frame_bytes > i32::MAX as usize {
            anyhow::bail!("max_frame_bytes must be between 1 and {}", i32::MAX);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation() {
        let valid = ClientConfig {
            listen_addr: "tcp:127.0.0.1:7070".to_string(),
            channel_mode: ChannelMode::Threaded,
            heartbeat_interval_ms: 100,
            max_frame_bytes: 4096,
            overlap_policy: OverlapPolicy::Reject,
            fetch_progress_delay_ms: 0,
        };
        assert!(valid.validate().is_ok());

        let no_heartbeat = ClientConfig {
            heartbeat_interval_ms: 0,
            ..valid.clone()
        };
        assert!(no_heartbeat.validate().is_err());

        let bad_addr = ClientConfig {
            listen_addr: "udp:somewhere".to_string(),
            ..valid
        };
        assert!(bad_addr.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "overlap_policy = \"first_wins\"").unwrap();
        writeln!(file, "heartbeat_interval_ms = 250").unwrap();

        let config = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.overlap_policy, OverlapPolicy::FirstWins);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }
}
