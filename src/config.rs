//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::relay::{BroadcastConfig, RegistryConfig, RelayConfig, SessionKey};
use crate::upstream::UpstreamConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamSection,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    // Flat keys of single-level config files; folded into the sections
    // above on parse, where they win over the sectioned values
    #[serde(default)]
    port: Option<u16>,

    #[serde(default, alias = "upstreamBaseUrl")]
    upstream_base_url: Option<String>,

    #[serde(default, alias = "pollIntervalMs")]
    poll_interval_ms: Option<u64>,
}

/// Listening socket and per-connection limits
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound frames queued per connection
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_max_connections() -> usize {
    1000
}

fn default_connection_buffer() -> usize {
    16
}

fn default_write_timeout() -> u64 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            connection_buffer: default_connection_buffer(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

/// Upstream terrarium API
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_base_url", alias = "upstreamBaseUrl", alias = "upstream_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    5000
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

/// Session poll loops
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval", alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,

    /// User polled for clients that connect without `?user=`
    #[serde(default = "default_user")]
    pub default_user: String,
}

fn default_poll_interval() -> u64 {
    10_000
}

fn default_user() -> String {
    "1".to_string()
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            default_user: default_user(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
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

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })?;
        config.fold_flat_keys();
        Ok(config)
    }

    fn fold_flat_keys(&mut self) {
        if let Some(port) = self.port.take() {
            self.server.port = port;
        }
        if let Some(url) = self.upstream_base_url.take() {
            self.upstream.base_url = url;
        }
        if let Some(ms) = self.poll_interval_ms.take() {
            self.poller.poll_interval_ms = ms;
        }
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
            dirs::config_dir().map(|p| p.join("terrarium-relay").join("config.toml")),
            Some(PathBuf::from("/etc/terrarium-relay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `TERRARIUM_RELAY_*` overrides resolved through `lookup`
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("TERRARIUM_RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TERRARIUM_RELAY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        if let Some(url) = lookup("TERRARIUM_RELAY_UPSTREAM_URL") {
            self.upstream.base_url = url;
        }

        if let Some(ms) = lookup("TERRARIUM_RELAY_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.poller.poll_interval_ms = ms;
        }
        if let Some(user) = lookup("TERRARIUM_RELAY_DEFAULT_USER") {
            self.poller.default_user = user;
        }

        if let Some(level) = lookup("TERRARIUM_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TERRARIUM_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("poller.poll_interval_ms", self.poller.poll_interval_ms),
            ("server.write_timeout_ms", self.server.write_timeout_ms),
            ("upstream.request_timeout_ms", self.upstream.request_timeout_ms),
            ("server.connection_buffer", self.server.connection_buffer as u64),
            ("server.max_connections", self.server.max_connections as u64),
        ];

        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "upstream.base_url",
                reason: "must not be empty".to_string(),
            });
        }

        if self.poller.default_user.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "poller.default_user",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig::new(self.server.host.clone(), self.server.port)
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream.base_url.clone(),
            request_timeout_ms: self.upstream.request_timeout_ms,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(self.poller.poll_interval_ms),
            connection_buffer: self.server.connection_buffer,
            default_session: SessionKey::new(self.poller.default_user.trim()),
            registry: RegistryConfig {
                max_connections: self.server.max_connections,
            },
            broadcast: BroadcastConfig {
                write_timeout: Duration::from_millis(self.server.write_timeout_ms),
            },
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

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Terrarium Relay Configuration
#
# Environment variables override these settings:
# - TERRARIUM_RELAY_HOST
# - TERRARIUM_RELAY_PORT
# - TERRARIUM_RELAY_UPSTREAM_URL
# - TERRARIUM_RELAY_POLL_INTERVAL_MS
# - TERRARIUM_RELAY_DEFAULT_USER
# - TERRARIUM_RELAY_LOG_LEVEL
# - TERRARIUM_RELAY_LOG_FORMAT

[server]
# Host and port for WebSocket clients and the operator endpoints
host = "0.0.0.0"
port = 8082

# Connections accepted across all sessions
max_connections = 1000

# Snapshots queued per connection before writes start timing out
connection_buffer = 16

# A connection that cannot take a snapshot within this time is dropped (ms)
write_timeout_ms = 5000

[upstream]
# Terrarium API base URL
base_url = "http://localhost:8080"

# Timeout for each upstream request (ms)
request_timeout_ms = 5000

[poller]
# How often each active session polls the upstream (ms)
poll_interval_ms = 10000

# User polled for clients that connect without ?user=
default_user = "1"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8082);
        assert_eq!(config.upstream.base_url, "http://localhost:8080");
        assert_eq!(config.poller.poll_interval_ms, 10_000);
        assert_eq!(config.poller.default_user, "1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_matches_defaults() {
        let config = Config::parse(&generate_default_config()).unwrap();
        let defaults = Config::default();

        assert_eq!(config.server.host, defaults.server.host);
        assert_eq!(config.server.write_timeout_ms, defaults.server.write_timeout_ms);
        assert_eq!(config.upstream.base_url, defaults.upstream.base_url);
        assert_eq!(config.poller.poll_interval_ms, defaults.poller.poll_interval_ms);
        assert_eq!(config.logging.format, defaults.logging.format);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[upstream]
base_url = "http://terrarium-api:8080"

[poller]
poll_interval_ms = 2500
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.upstream.base_url, "http://terrarium-api:8080");
        assert_eq!(config.poller.poll_interval_ms, 2500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = Config::parse(
            r#"
[upstream]
upstreamBaseUrl = "http://api.local"

[poller]
pollIntervalMs = 500
"#,
        )
        .unwrap();

        assert_eq!(config.upstream.base_url, "http://api.local");
        assert_eq!(config.poller.poll_interval_ms, 500);
    }

    #[test]
    fn test_flat_top_level_keys() {
        let config = Config::parse(
            r#"
port = 9300
upstreamBaseUrl = "http://flat.local"
pollIntervalMs = 1500

[server]
port = 9000
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9300);
        assert_eq!(config.upstream.base_url, "http://flat.local");
        assert_eq!(config.poller.poll_interval_ms, 1500);
        assert_eq!(config.relay_config().poll_interval, Duration::from_millis(1500));
    }

    #[test]
    fn test_flat_snake_case_keys() {
        let config = Config::parse(
            r#"
upstream_base_url = "http://snake.local"
poll_interval_ms = 250
"#,
        )
        .unwrap();

        assert_eq!(config.upstream.base_url, "http://snake.local");
        assert_eq!(config.poller.poll_interval_ms, 250);
        assert_eq!(config.server.port, 8082);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/terrarium-relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TERRARIUM_RELAY_PORT", "9200"),
            ("TERRARIUM_RELAY_UPSTREAM_URL", "http://override:1234"),
            ("TERRARIUM_RELAY_POLL_INTERVAL_MS", "750"),
            ("TERRARIUM_RELAY_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9200);
        assert_eq!(config.upstream.base_url, "http://override:1234");
        assert_eq!(config.poller.poll_interval_ms, 750);
        assert!(config.logging.is_json());
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_unparseable_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| {
            (key == "TERRARIUM_RELAY_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.server.port, 8082);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.poller.poll_interval_ms = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poller.poll_interval_ms"));
    }

    #[test]
    fn test_validate_rejects_empty_base_url() {
        let mut config = Config::default();
        config.upstream.base_url = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "upstream.base_url", .. })
        ));
    }

    #[test]
    fn test_relay_config_conversion() {
        let mut config = Config::default();
        config.poller.poll_interval_ms = 1500;
        config.poller.default_user = "42".to_string();
        config.server.write_timeout_ms = 250;
        config.server.max_connections = 3;

        let relay = config.relay_config();
        assert_eq!(relay.poll_interval, Duration::from_millis(1500));
        assert_eq!(relay.default_session.as_str(), "42");
        assert_eq!(relay.broadcast.write_timeout, Duration::from_millis(250));
        assert_eq!(relay.registry.max_connections, 3);

        assert_eq!(config.api_config().addr(), "0.0.0.0:8082");
        assert_eq!(config.upstream_config().request_timeout_ms, 5000);
    }
}
