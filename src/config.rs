//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::websocket::HubConfig;

/// Slowest allowed producer cadence (Hz)
pub const MIN_CADENCE_HZ: f64 = 1.0;
/// Fastest allowed producer cadence (Hz)
pub const MAX_CADENCE_HZ: f64 = 60.0;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Streaming server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_handshake_buffer")]
    pub handshake_buffer_bytes: usize,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8470
}

fn default_max_connections() -> usize {
    64
}

fn default_max_payload() -> usize {
    1_000_000
}

fn default_handshake_buffer() -> usize {
    4096
}

fn default_handshake_timeout() -> u64 {
    5000 // 5 seconds
}

fn default_send_timeout() -> u64 {
    250
}

fn default_shutdown_timeout() -> u64 {
    1000 // 1 second
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_payload_bytes: default_max_payload(),
            handshake_buffer_bytes: default_handshake_buffer(),
            handshake_timeout_ms: default_handshake_timeout(),
            send_timeout_ms: default_send_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Socket address string to bind
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Hub settings derived from this config
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.max_connections,
            max_payload: self.max_payload_bytes,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

/// Snapshot producer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Snapshots per second
    #[serde(default = "default_cadence")]
    pub cadence_hz: f64,
}

fn default_cadence() -> f64 {
    10.0
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            cadence_hz: default_cadence(),
        }
    }
}

impl ProducerConfig {
    /// Tick interval, with the cadence clamped to 1–60 Hz
    pub fn interval(&self) -> Duration {
        let hz = if self.cadence_hz.is_finite() {
            self.cadence_hz.clamp(MIN_CADENCE_HZ, MAX_CADENCE_HZ)
        } else {
            default_cadence()
        };
        Duration::from_secs_f64(1.0 / hz)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tickcast").join("config.toml")),
            Some(PathBuf::from("/etc/tickcast/config.toml")),
            Some(PathBuf::from("./tickcast.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TICKCAST_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TICKCAST_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(hz) = std::env::var("TICKCAST_CADENCE_HZ") {
            if let Ok(hz) = hz.parse() {
                self.producer.cadence_hz = hz;
            }
        }

        if let Ok(level) = std::env::var("TICKCAST_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TICKCAST_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Tickcast Configuration
#
# Environment variables override these settings:
# - TICKCAST_HOST
# - TICKCAST_PORT
# - TICKCAST_CADENCE_HZ
# - TICKCAST_LOG_LEVEL
# - TICKCAST_LOG_FORMAT

[server]
# Interface to listen on (keep on loopback for a local stream)
host = "127.0.0.1"

# WebSocket port
port = 8470

# Maximum concurrent subscribers
max_connections = 64

# Snapshots larger than this are replaced by an error indicator (bytes)
max_payload_bytes = 1000000

# Upper bound on the upgrade request size (bytes)
handshake_buffer_bytes = 4096

# Time allowed for a client to complete the upgrade (ms)
handshake_timeout_ms = 5000

# Time allowed for one frame write before a subscriber is dropped (ms)
send_timeout_ms = 250

# How long stop waits for the accept loop to exit (ms)
shutdown_timeout_ms = 1000

[producer]
# Snapshots per second, clamped to 1-60
cadence_hz = 10.0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
