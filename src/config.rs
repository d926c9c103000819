//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the handshake pipeline.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Environment variables (`HANDSHAKE_PIPELINE_*`) via [`NetworkConfig::from_env`]
//! - Direct instantiation with defaults
//!
//! Durations are written as integer milliseconds.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::core::buffer::DEFAULT_CAPACITY;
use crate::core::frame::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use crate::transport::Endpoint;
use crate::utils::crypto::CipherSuite;
use crate::utils::timeout;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "HANDSHAKE_PIPELINE_";

/// Default bound on queued readers and backlogged frames per channel
pub const MAX_PENDING_FRAMES: usize = 64;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ProtocolError::ConfigError(format!("Invalid value for {ENV_PREFIX}{name}: '{raw}'"))
        }),
    }
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `HANDSHAKE_PIPELINE_*` environment variables.
    ///
    /// Unlike a missing variable, a variable that does not parse is an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = env_var("SERVER_ADDRESS") {
            config.server.address = address;
        }
        if let Some(port) = env_parse::<u16>("LOCAL_PORT")? {
            config.server.local_port = Some(port);
        }
        if let Some(port) = env_parse::<u16>("MIGRATE_TO")? {
            config.server.migrate_to = Some(port);
        }
        if let Some(max) = env_parse::<usize>("MAX_CONNECTIONS")? {
            config.server.max_connections = max;
        }
        if let Some(address) = env_var("CLIENT_ADDRESS") {
            config.client.address = address;
        }
        if let Some(ms) = env_parse::<u64>("CONNECTION_TIMEOUT_MS")? {
            config.client.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("HANDSHAKE_TIMEOUT_MS")? {
            config.handshake.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("MAX_FRAME_SIZE")? {
            config.handshake.max_frame_size = size;
        }
        if let Some(level) = env_parse::<Level>("LOG_LEVEL")? {
            config.logging.log_level = level;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.handshake.validate());
        errors.extend(self.logging.validate());

        if let (Some(local), Some(target)) = (self.server.local_port, self.server.migrate_to) {
            if local == target {
                errors.push(format!("migrate_to ({target}) must differ from local_port"));
            }
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TCP listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// In-process port to additionally accept on, when serving a [`LocalHub`](crate::transport::local::LocalHub)
    #[serde(default)]
    pub local_port: Option<u16>,

    /// Port that fresh sessions are told to migrate to
    #[serde(default)]
    pub migrate_to: Option<u16>,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Maximum number of sessions held by the registry, parked ones included
    pub max_sessions: usize,

    /// How long a migrating or dropped session can be resumed
    #[serde(with = "duration_serde")]
    pub resume_ttl: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            local_port: None,
            migrate_to: None,
            max_connections: 1000,
            max_sessions: 4096,
            resume_ttl: timeout::RESUME_TTL,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.max_sessions < self.max_connections {
            errors.push(format!(
                "Max sessions ({}) must be at least max connections ({})",
                self.max_sessions, self.max_connections
            ));
        }

        if self.migrate_to == Some(0) {
            errors.push("migrate_to cannot be port 0".to_string());
        }

        if self.resume_ttl.as_millis() < 100 {
            errors.push("Resume TTL too short (minimum: 100ms)".to_string());
        } else if self.resume_ttl.as_secs() > 3600 {
            errors.push("Resume TTL too long (maximum: 1 hour)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address as `host:port`
    pub address: String,

    /// Timeout for each connection attempt, migrations included
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How often async callers poll a client operation chain
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            poll_interval: timeout::TICK_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// The TCP endpoint described by `address`
    pub fn endpoint(&self) -> Result<Endpoint> {
        let (host, port) = self.address.rsplit_once(':').ok_or_else(|| {
            ProtocolError::ConfigError(format!("Client address '{}' has no port", self.address))
        })?;
        let port = port.parse::<u16>().map_err(|_| {
            ProtocolError::ConfigError(format!("Invalid port in client address '{}'", self.address))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Endpoint::tcp(host, port))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if let Err(e) = self.endpoint() {
            errors.push(e.to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.poll_interval.is_zero() {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        errors
    }
}

/// Pipeline and framing limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandshakeConfig {
    /// Largest frame body accepted from a peer
    pub max_frame_size: usize,

    /// Starting capacity of each connection's inbox and outgoing buffer
    pub initial_buffer_capacity: usize,

    /// Bound on queued readers and backlogged frames per channel
    pub max_pending_frames: usize,

    /// Budget for a whole handshake, reconnects included
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Stream cipher used when a handshake bootstraps a session key
    #[serde(default)]
    pub cipher_suite: CipherSuite,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            initial_buffer_capacity: DEFAULT_CAPACITY,
            max_pending_frames: MAX_PENDING_FRAMES,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            cipher_suite: CipherSuite::default(),
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        if self.initial_buffer_capacity == 0 {
            errors.push("Initial buffer capacity must be greater than 0".to_string());
        } else if self.initial_buffer_capacity > self.max_frame_size {
            errors.push("Initial buffer capacity cannot exceed max frame size".to_string());
        }

        if self.max_pending_frames == 0 {
            errors.push("Max pending frames must be greater than 0".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("handshake-pipeline"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// `tracing::Level` as a lowercase name
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn test_example_config_round_trips() {
        let parsed = NetworkConfig::from_toml(&NetworkConfig::example_config()).unwrap();
        assert_eq!(parsed.handshake.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }

    #[test]
    fn test_client_endpoint_parsing() {
        let client = ClientConfig {
            address: "[::1]:7000".into(),
            ..ClientConfig::default()
        };
        assert_eq!(client.endpoint().unwrap(), Endpoint::tcp("::1", 7000));

        let client = ClientConfig {
            address: "example.org".into(),
            ..ClientConfig::default()
        };
        assert!(client.endpoint().is_err());
    }

    #[test]
    fn test_migration_target_must_differ() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.local_port = Some(5);
            c.server.migrate_to = Some(5);
        });
        assert!(config.validate_strict().is_err());
    }
}
