//! Configuration management for chanbridge
//!
//! Every section has serde defaults, so an empty file (or no file at all) is a
//! valid configuration. Files are read as TOML or JSON depending on extension.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::transport::DEFAULT_MAX_FRAME_LENGTH;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChanConfig {
    /// Framing limits for every connection
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bus routing policy
    #[serde(default)]
    pub bus: BusConfig,

    /// Process bridge settings (descriptor hand-off, handshake)
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest frame accepted or produced, in bytes
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_length: default_max_frame_length(),
        }
    }
}

/// What the bus does when an address that is already registered is registered again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReregistrationPolicy {
    /// The newest registration wins (default)
    #[default]
    Replace,
    /// The first registration is kept; later ones are refused
    Reject,
}

/// Bus configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Policy for duplicate registrations
    #[serde(default)]
    pub reregistration: ReregistrationPolicy,

    /// Transport settings for connections accepted by the bus
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Process bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Descriptor number the socket occupies in a spawned child
    #[serde(default = "default_child_fd")]
    pub child_fd: i32,

    /// Environment variable that tells the child which descriptor to use
    #[serde(default = "default_fd_env_var")]
    pub fd_env_var: String,

    /// Message sent in the liveness handshake
    #[serde(default = "default_handshake_message")]
    pub handshake_message: String,

    /// Transport settings for the bridge connection
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_child_fd() -> i32 {
    3
}

fn default_fd_env_var() -> String {
    "CHANBRIDGE_FD".to_string()
}

fn default_handshake_message() -> String {
    "hello".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            child_fd: default_child_fd(),
            fd_env_var: default_fd_env_var(),
            handshake_message: default_handshake_message(),
            transport: TransportConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "chanbridge=debug"). RUST_LOG takes precedence.
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,
}

impl ChanConfig {
    /// Load configuration from a TOML or JSON file, chosen by extension
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChanConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ChanConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport.validate()?;
        self.bus.transport.validate()?;
        self.bridge.validate()?;
        Ok(())
    }
}

impl TransportConfig {
    /// Validate framing limits
    pub fn validate(&self) -> anyhow::Result<()> {
        // Room for the bincode frame header plus a small payload
        if self.max_frame_length < 64 {
            return Err(anyhow::anyhow!(
                "max_frame_length must be at least 64 bytes, got {}",
                self.max_frame_length
            ));
        }
        Ok(())
    }
}

impl BridgeConfig {
    /// Validate bridge settings
    pub fn validate(&self) -> anyhow::Result<()> {
        // 0-2 are the child's stdio
        if self.child_fd < 3 {
            return Err(anyhow::anyhow!(
                "child_fd must be 3 or higher so stdio stays intact, got {}",
                self.child_fd
            ));
        }
        if self.fd_env_var.is_empty() || self.fd_env_var.contains('=') {
            return Err(anyhow::anyhow!(
                "fd_env_var must be a non-empty name without '=', got {:?}",
                self.fd_env_var
            ));
        }
        if self.handshake_message.is_empty() {
            return Err(anyhow::anyhow!("handshake_message must not be empty"));
        }
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ChanConfig::default();
        assert_eq!(config.transport.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(config.bus.reregistration, ReregistrationPolicy::Replace);
        assert_eq!(config.bridge.child_fd, 3);
        assert_eq!(config.bridge.fd_env_var, "CHANBRIDGE_FD");
        assert_eq!(config.bridge.handshake_message, "hello");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[bus]\nreregistration = \"reject\"\n\n[logging]\nfilter = \"debug\""
        )
        .unwrap();

        let config = ChanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bus.reregistration, ReregistrationPolicy::Reject);
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
        assert_eq!(config.bridge, BridgeConfig::default());
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chanbridge.json");

        let mut config = ChanConfig::default();
        config.bridge.child_fd = 5;
        config.to_json_file(&path).unwrap();

        assert_eq!(ChanConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ChanConfig::default();
        config.bridge.child_fd = 1;
        assert!(config.validate().is_err());

        let mut config = ChanConfig::default();
        config.bridge.fd_env_var = "A=B".to_string();
        assert!(config.validate().is_err());

        let mut config = ChanConfig::default();
        config.transport.max_frame_length = 8;
        assert!(config.validate().is_err());
    }
}
