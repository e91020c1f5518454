//! Configuration file support
//!
//! Loads defaults from ~/.config/lanbench/config.toml. Command-line flags
//! take precedence over anything set here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::ProtocolConfig;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub protocol: ProtocolDefaults,

    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub server: ServerDefaults,
}

/// Constants shared by both ends. Both sides must agree for discovery and
/// decoding to work.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProtocolDefaults {
    /// UDP port offers are broadcast to
    pub discovery_port: Option<u16>,

    /// Magic cookie at the start of every message
    pub magic: Option<u32>,
}

/// Default settings for client mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Bytes per transfer (e.g., "10M", "512K", "1000")
    pub file_size: Option<String>,

    /// Number of parallel TCP transfers
    pub tcp_connections: Option<u32>,

    /// Number of parallel UDP transfers
    pub udp_connections: Option<u32>,

    /// UDP idle timeout in milliseconds
    pub idle_timeout_ms: Option<u64>,

    /// Log file path (e.g., "~/.config/lanbench/lanbench.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    /// First port scanned for the data sockets
    pub port_range_start: Option<u16>,

    /// Last port scanned for the data sockets
    pub port_range_end: Option<u16>,

    /// UDP segments sent per burst
    pub burst_size: Option<u64>,

    /// Pause after each burst, in microseconds
    pub burst_delay_us: Option<u64>,

    /// Offer destination (e.g., "255.255.255.255", "192.168.1.255")
    pub broadcast_addr: Option<String>,

    /// Log file path
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if the file
    /// doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanbench")
            .join("config.toml")
    }

    /// Protocol constants with file overrides applied
    pub fn protocol_config(&self) -> ProtocolConfig {
        let defaults = ProtocolConfig::default();
        ProtocolConfig {
            magic: self.protocol.magic.unwrap_or(defaults.magic),
            discovery_port: self
                .protocol
                .discovery_port
                .unwrap_or(defaults.discovery_port),
            ..defaults
        }
    }
}

impl ClientDefaults {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

impl ServerDefaults {
    pub fn burst_delay(&self) -> Option<Duration> {
        self.burst_delay_us.map(Duration::from_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.client.file_size.is_none());
        assert!(config.server.port_range_start.is_none());
        assert_eq!(config.protocol_config(), ProtocolConfig::default());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[protocol]
discovery_port = 40000

[client]
file_size = "10M"
tcp_connections = 3
udp_connections = 2
idle_timeout_ms = 250

[server]
port_range_start = 30000
port_range_end = 31000
burst_size = 32
burst_delay_us = 500
broadcast_addr = "192.168.1.255"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.client.file_size.as_deref(), Some("10M"));
        assert_eq!(config.client.tcp_connections, Some(3));
        assert_eq!(config.client.udp_connections, Some(2));
        assert_eq!(config.client.idle_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.server.port_range_start, Some(30000));
        assert_eq!(config.server.burst_size, Some(32));
        assert_eq!(config.server.burst_delay(), Some(Duration::from_micros(500)));

        let protocol = config.protocol_config();
        assert_eq!(protocol.discovery_port, 40000);
        assert_eq!(protocol.magic, crate::protocol::MAGIC_COOKIE);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\ntcp_connections = 7").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.client.tcp_connections, Some(7));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert!(config.client.tcp_connections.is_none());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client\ntcp_connections = ").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}
