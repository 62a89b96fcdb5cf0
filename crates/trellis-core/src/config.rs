//! Configuration loading and typed config structures for a Trellis
//! environment.
//!
//! The configuration lives in `trellis.yaml`. The structs here mirror the
//! YAML layout; every field has a default, so an empty file boots a working
//! development environment.

use std::path::Path;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level environment configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvironmentConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Secret used to sign socket ids and other tokens.
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Host and path normalisation.
    #[serde(default)]
    pub normalizer: NormalizerConfig,

    /// Realtime (WebSocket) server settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Data layer settings.
    #[serde(default)]
    pub data: DataConfig,
}

impl EnvironmentConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override values after parsing:
    /// - `TRELLIS_SECRET` overrides `secret`
    /// - `REDIS_URL` overrides both Redis adapter URLs
    /// - `PORT` overrides `server.port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override infrastructure values with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TRELLIS_SECRET") {
            self.secret = val;
        }
        if let Ok(val) = std::env::var("REDIS_URL") {
            self.realtime.adapter_settings.redis_url.clone_from(&val);
            self.data.subscriptions.adapter_settings.redis_url = val;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG` is
    /// unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Redirect rules applied before dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct NormalizerConfig {
    /// Collapse duplicate slashes and drop trailing slashes.
    #[serde(default)]
    pub strict_path: bool,

    /// Enforce one canonical form of the `www` host.
    #[serde(default)]
    pub strict_www: bool,

    /// With `strict_www`, redirect bare hosts to `www.`; otherwise redirect
    /// `www.` hosts to the bare host.
    #[serde(default)]
    pub require_www: bool,
}

/// Which backend a pluggable component uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// In-process state; single server only.
    #[default]
    Memory,
    /// Redis-backed state shared by every process.
    Redis,
}

/// Connection settings for Redis-backed adapters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdapterSettings {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key written.
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            redis_prefix: default_redis_prefix(),
        }
    }
}

/// Socket timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RealtimeTimeouts {
    /// Seconds between `beat` frames.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Seconds a departed subscriber's data subscriptions survive.
    #[serde(default = "default_disconnect_secs")]
    pub disconnect_secs: u64,
}

impl Default for RealtimeTimeouts {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            disconnect_secs: default_disconnect_secs(),
        }
    }
}

/// Realtime server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RealtimeConfig {
    /// Mount the realtime behaviour at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path the upgrade request must target.
    #[serde(default = "default_realtime_path")]
    pub path: String,

    /// Channel adapter backend.
    #[serde(default)]
    pub adapter: AdapterKind,

    /// Backend settings.
    #[serde(default)]
    pub adapter_settings: AdapterSettings,

    /// Heartbeat and disconnect timing.
    #[serde(default)]
    pub timeouts: RealtimeTimeouts,

    /// Log the HTTP request that opens a socket.
    #[serde(default)]
    pub log_initial_request: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_realtime_path(),
            adapter: AdapterKind::default(),
            adapter_settings: AdapterSettings::default(),
            timeouts: RealtimeTimeouts::default(),
            log_initial_request: false,
        }
    }
}

/// Data layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DataConfig {
    /// Subscription engine settings.
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
}

/// Subscription engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionsConfig {
    /// Subscriber adapter backend.
    #[serde(default)]
    pub adapter: AdapterKind,

    /// Backend settings.
    #[serde(default)]
    pub adapter_settings: AdapterSettings,

    /// Delivery workers; zero delivers inline.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::default(),
            adapter_settings: AdapterSettings::default(),
            workers: default_workers(),
        }
    }
}

fn default_secret() -> String {
    "trellis-development-secret".to_owned()
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_redis_prefix() -> String {
    "pw".to_owned()
}

fn default_realtime_path() -> String {
    "/pw-socket".to_owned()
}

const fn default_heartbeat_secs() -> u64 {
    3
}

const fn default_disconnect_secs() -> u64 {
    60
}

const fn default_workers() -> usize {
    4
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EnvironmentConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.realtime.path, "/pw-socket");
        assert_eq!(config.realtime.adapter, AdapterKind::Memory);
        assert_eq!(config.realtime.timeouts.heartbeat_secs, 3);
        assert_eq!(config.data.subscriptions.adapter_settings.redis_prefix, "pw");
        assert!(config.realtime.enabled);
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 4000

logging:
  level: "debug"
  format: json

normalizer:
  strict_path: true
  strict_www: true
  require_www: false

realtime:
  path: "/socket"
  adapter: redis
  adapter_settings:
    redis_prefix: "app"
  timeouts:
    heartbeat_secs: 10
    disconnect_secs: 5
  log_initial_request: true

data:
  subscriptions:
    adapter: redis
    workers: 0
"#;
        let config = EnvironmentConfig::parse(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.normalizer.strict_path);
        assert!(!config.normalizer.require_www);
        assert_eq!(config.realtime.path, "/socket");
        assert_eq!(config.realtime.adapter, AdapterKind::Redis);
        assert_eq!(config.realtime.adapter_settings.redis_prefix, "app");
        assert_eq!(config.realtime.timeouts.disconnect_secs, 5);
        assert!(config.realtime.log_initial_request);
        assert_eq!(config.data.subscriptions.adapter, AdapterKind::Redis);
        assert_eq!(config.data.subscriptions.workers, 0);
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = EnvironmentConfig::parse("realtime:\n  enabled: false\n").unwrap();
        assert!(!config.realtime.enabled);
        // Everything else uses defaults
        assert_eq!(config.realtime.path, "/pw-socket");
        assert_eq!(config.data.subscriptions.workers, 4);
    }

    #[test]
    fn parse_empty_yaml() {
        assert!(EnvironmentConfig::parse("").is_ok());
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let result = EnvironmentConfig::parse("server: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }
}
