//! Node configuration
//!
//! [`NodeConfig`] is the runtime value object handed to a node.
//! [`NodeSettings`] is its serialisable form, loaded from JSON by the
//! console binary.

use crate::logging::{LogLogger, Logger, SilentLogger};
use crate::network::address::Address;
use crate::network::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::network::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_DIAL_RETRIES: u32 = 20;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runtime configuration of a node
#[derive(Clone)]
pub struct NodeConfig {
    /// Largest payload accepted or sent in one frame
    pub max_frame_bytes: usize,
    /// Connection attempts per dial, including the first
    pub dial_retries: u32,
    /// Pause between failed dial attempts
    pub retry_delay: Duration,
    /// Pause after a detected failure before acting on it
    pub poll_interval: Duration,
    /// Lifecycle message sink
    pub logger: Arc<dyn Logger>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            dial_retries: DEFAULT_DIAL_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            logger: Arc::new(LogLogger),
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("dial_retries", &self.dial_retries)
            .field("retry_delay", &self.retry_delay)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl NodeConfig {
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn with_dial_retries(mut self, dial_retries: u32) -> Self {
        self.dial_retries = dial_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Check the values a node can run with
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_frame_bytes == 0 || self.max_frame_bytes > i32::MAX as usize {
            return Err(MeshError::Configuration(format!(
                "max_frame_bytes must be within 1..={}, got {}",
                i32::MAX,
                self.max_frame_bytes
            )));
        }
        if self.dial_retries == 0 {
            return Err(MeshError::Configuration(
                "dial_retries must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(MeshError::Configuration(
                "poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Serialisable node settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Address to listen on
    pub listen: Address,
    /// Addresses to dial on start
    pub peers: Vec<Address>,
    pub max_frame_bytes: usize,
    pub dial_retries: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Use the silent logger instead of the `log` facade
    pub silent: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            listen: Address::localhost(9200),
            peers: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            dial_retries: DEFAULT_DIAL_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            silent: false,
        }
    }
}

impl NodeSettings {
    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| {
            MeshError::Configuration(format!("invalid settings in {}: {}", path.display(), e))
        })
    }

    /// Write settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> MeshResult<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| MeshError::Configuration(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Split into the listen address, peers and a validated config
    pub fn into_parts(self) -> MeshResult<(Address, Vec<Address>, NodeConfig)> {
        let logger: Arc<dyn Logger> = if self.silent {
            Arc::new(SilentLogger)
        } else {
            Arc::new(LogLogger)
        };
        let config = NodeConfig::default()
            .with_max_frame_bytes(self.max_frame_bytes)
            .with_dial_retries(self.dial_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_logger(logger);
        config.validate()?;
        Ok((self.listen, self.peers, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.max_frame_bytes, 8192);
        assert_eq!(config.dial_retries, 20);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            NodeConfig::default().with_max_frame_bytes(0),
            NodeConfig::default().with_max_frame_bytes(i32::MAX as usize + 1),
            NodeConfig::default().with_dial_retries(0),
            NodeConfig::default().with_poll_interval(Duration::ZERO),
        ];
        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(MeshError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_debug_hides_logger() {
        let debug = format!("{:?}", NodeConfig::default());
        assert!(debug.contains("max_frame_bytes: 8192"));
        assert!(!debug.contains("logger"));
    }

    #[test]
    fn test_settings_partial_json() {
        let json = r#"{ "listen": "127.0.0.1:9201", "peers": ["127.0.0.1:9200"], "max_frame_bytes": 1000 }"#;
        let settings: NodeSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.listen, Address::localhost(9201));
        assert_eq!(settings.peers, vec![Address::localhost(9200)]);
        assert_eq!(settings.max_frame_bytes, 1000);
        assert_eq!(settings.dial_retries, 20);

        let (listen, peers, config) = settings.into_parts().unwrap();
        assert_eq!(listen.port(), 9201);
        assert_eq!(peers.len(), 1);
        assert_eq!(config.max_frame_bytes, 1000);
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");

        let settings = NodeSettings {
            peers: vec![Address::localhost(9300)],
            retry_delay_ms: 50,
            silent: true,
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let loaded = NodeSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_settings_invalid_values() {
        let settings = NodeSettings {
            dial_retries: 0,
            ..Default::default()
        };
        assert!(settings.into_parts().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "listen": "no-port" }"#).unwrap();
        assert!(matches!(
            NodeSettings::load(&path),
            Err(MeshError::Configuration(_))
        ));
    }
}
