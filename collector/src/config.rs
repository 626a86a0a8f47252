//! Configuration types for the collector

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolgear_shared::protocol::{ChannelMode, Endpoint, LocationSpec, DEFAULT_MAX_FRAME_BYTES};

/// One startup instrumentation rule, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRule {
    /// Regex matched against the function (or callee) name
    pub pattern: String,

    /// Point type: entry, exit, call or * (default)
    #[serde(default = "wildcard")]
    pub kind: String,

    /// Point location: before, after or * (default)
    #[serde(default = "wildcard")]
    pub location: String,

    /// Action type tag to activate
    pub action: String,
}

fn wildcard() -> String {
    "*".to_string()
}

impl InstrumentRule {
    pub fn to_spec(&self) -> anyhow::Result<LocationSpec> {
        Ok(LocationSpec {
            pattern: self.pattern.clone(),
            kind: self.kind.parse()?,
            location: self.location.parse()?,
            action_type: self.action.clone(),
        })
    }
}

/// Collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Client address (unix:/path, tcp:host:port)
    pub client_addr: String,

    /// Cooperative or background-thread transport
    pub channel_mode: ChannelMode,

    /// Largest frame payload accepted from the client
    pub max_frame_bytes: usize,

    /// Quit when no heartbeat arrives for this long (0 = never)
    pub heartbeat_timeout_secs: u64,

    /// Event loop tick
    pub poll_interval_ms: u64,

    /// TOML description of the target program
    pub program_manifest: Option<PathBuf>,

    /// Directories searched for source files
    pub source_paths: Vec<PathBuf>,

    /// Instrumentation applied right after connecting
    pub instrument: Vec<InstrumentRule>,

    /// Connection attempts before giving up
    pub connect_attempts: u32,

    /// Delay before the first reconnect, doubled each attempt
    pub connect_backoff_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            client_addr: "unix:/tmp/toolgear.sock".to_string(),
            channel_mode: ChannelMode::Cooperative,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            heartbeat_timeout_secs: 30,
            poll_interval_ms: 50,
            program_manifest: None,
            source_paths: Vec::new(),
            instrument: Vec::new(),
            connect_attempts: 5,
            connect_backoff_ms: 200,
        }
    }
}

impl CollectorConfig {
    /// Load from a TOML file; missing keys take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        self.client_addr.parse()
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        match self.heartbeat_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn location_specs(&self) -> anyhow::Result<Vec<LocationSpec>> {
        self.instrument.iter().map(InstrumentRule::to_spec).collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.endpoint()?;

        if self.max_frame_bytes == 0 {
            anyhow::bail!("max_frame_bytes must be greater than 0");
        }

        if self.max_frame_bytes > i32::MAX as usize {
            anyhow::bail!("max_frame_bytes cannot exceed {}", i32::MAX);
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.connect_attempts == 0 {
            anyhow::bail!("connect_attempts must be at least 1");
        }

        self.location_specs()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgear_shared::types::program::{PointKind, PointLocation};

    #[test]
    fn test_config_validation() {
        let valid = CollectorConfig {
            client_addr: "tcp:127.0.0.1:7070".to_string(),
            channel_mode: ChannelMode::Threaded,
            max_frame_bytes: 1024,
            heartbeat_timeout_secs: 0,
            poll_interval_ms: 10,
            program_manifest: None,
            source_paths: vec![],
            instrument: vec![InstrumentRule {
                pattern: "^main$".to_string(),
                kind: "entry".to_string(),
                location: "*".to_string(),
                action: "count".to_string(),
            }],
            connect_attempts: 1,
            connect_backoff_ms: 0,
        };

        assert!(valid.validate().is_ok());
        assert_eq!(valid.heartbeat_timeout(), None);

        let invalid = CollectorConfig {
            instrument: vec![InstrumentRule {
                pattern: "x".to_string(),
                kind: "sideways".to_string(),
                location: "*".to_string(),
                action: "count".to_string(),
            }],
            ..valid.clone()
        };
        assert!(invalid.validate().is_err());

        let no_frames = CollectorConfig {
            max_frame_bytes: 0,
            ..valid
        };
        assert!(no_frames.validate().is_err());
    }

    #[test]
    fn test_toml_defaults_and_rules() {
        let config: CollectorConfig = toml::from_str(
            r#"
client_addr = "unix:/run/tg.sock"
channel_mode = "threaded"

[[instrument]]
pattern = "work"
action = "time"
"#,
        )
        .unwrap();

        assert_eq!(config.channel_mode, ChannelMode::Threaded);
        assert_eq!(config.heartbeat_timeout(), Some(Duration::from_secs(30)));
        let specs = config.location_specs().unwrap();
        assert_eq!(specs[0].kind, PointKind::Any);
        assert_eq!(specs[0].location, PointLocation::Any);
        assert_eq!(specs[0].action_type, "time");
    }
}
