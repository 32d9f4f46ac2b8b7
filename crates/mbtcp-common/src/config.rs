//! Configuration structures for the Modbus/TCP responder.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Largest register store addressable through a 16-bit start address.
pub const MAX_REGISTER_COUNT: usize = 65_536;

/// Top-level responder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Network and session settings.
    pub server: ServerConfig,

    /// Holding register store layout.
    pub registers: RegisterConfig,

    /// Wire compatibility switches.
    pub compat: CompatConfig,
}

/// Listener and session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface address to bind.
    pub bind_address: IpAddr,

    /// TCP port (502 is the registered Modbus port, 0 picks a free one).
    pub port: u16,

    /// Maximum concurrent sessions (0 = unlimited).
    pub max_sessions: usize,

    /// Read timeout used by sessions and the accept loop to notice a stop request.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Write timeout for responses.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Disable Nagle's algorithm on accepted connections.
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 502,
            max_sessions: 64,
            poll_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Socket address assembled from `bind_address` and `port`.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Loopback configuration on an ephemeral port, used by tests and demos.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    /// Check the socket timeouts, which must be non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "server.poll_interval must be non-zero".into(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "server.write_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Holding register store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    /// Number of holding registers.
    pub size: usize,

    /// Initial values written into the store at startup.
    pub preload: Vec<PreloadBlock>,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            size: 10_000,
            preload: Vec::new(),
        }
    }
}

/// A run of consecutive register values to load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadBlock {
    /// First register index.
    pub address: u16,
    /// Values for `address`, `address + 1`, ...
    pub values: Vec<u16>,
}

/// Switches that reproduce legacy wire behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatConfig {
    /// Send exception replies without the MBAP prefix (unit id, function, code only).
    pub bare_exception_frames: bool,

    /// Report a Write Multiple Registers byte-count mismatch as Illegal Data Value
    /// instead of Illegal Data Address.
    pub conventional_exception_codes: bool,
}

impl ResponderConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, bytes = content.len(), "Read configuration file");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.registers.size;
        if size == 0 || size > MAX_REGISTER_COUNT {
            return Err(ConfigError::Invalid(format!(
                "registers.size must be within 1..={MAX_REGISTER_COUNT}, got {size}"
            )));
        }

        for block in &self.registers.preload {
            let end = usize::from(block.address) + block.values.len();
            if end > size {
                return Err(ConfigError::Invalid(format!(
                    "preload block at {} with {} values exceeds store size {size}",
                    block.address,
                    block.values.len()
                )));
            }
        }

        self.server.validate()
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
