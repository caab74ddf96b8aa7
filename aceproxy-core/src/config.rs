use config::{Config as ConfigBuilder, ConfigError, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest upstream read size accepted by [`StreamingConfig::chunk_size_bytes`].
pub const MIN_CHUNK_SIZE_BYTES: usize = 8 * 1024;
/// Largest upstream read size accepted by [`StreamingConfig::chunk_size_bytes`].
pub const MAX_CHUNK_SIZE_BYTES: usize = 32 * 1024;
/// Accepted range for the per-client full-queue retry window.
pub const CLIENT_SEND_RETRY_RANGE_MILLIS: std::ops::RangeInclusive<u64> = 100..=150;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub streaming: StreamingConfig,
    pub logging: LoggingConfig,
}

/// Listen address of the viewer-facing HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 6881,
        }
    }
}

/// Where the external streaming engine lives and how long to wait for it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// "http" or "https"
    pub scheme: String,
    /// How long a subscriber waits for the upstream connection to start
    pub engine_timeout_seconds: u64,
    /// Bound on a single session-negotiation request
    pub no_response_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6878,
            scheme: "http".to_string(),
            engine_timeout_seconds: 15,
            no_response_timeout_seconds: 10,
        }
    }
}

/// Fan-out and upstream read tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Upstream silence that aborts the fetch loop
    pub empty_timeout_seconds: u64,
    /// How long a subscriber waits for the first chunk once the upstream started
    pub first_chunk_timeout_seconds: u64,
    pub chunk_size_bytes: usize,
    /// Per-client bounded queue length, in chunks
    pub client_queue_capacity: usize,
    pub client_send_retry_millis: u64,
    pub stale_client_threshold_seconds: u64,
    pub stale_sweep_interval_seconds: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            empty_timeout_seconds: 60,
            first_chunk_timeout_seconds: 15,
            chunk_size_bytes: MIN_CHUNK_SIZE_BYTES,
            client_queue_capacity: 50,
            client_send_retry_millis: 150,
            stale_client_threshold_seconds: 30,
            stale_sweep_interval_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl EngineConfig {
    /// Base URL of the engine, e.g. `http://localhost:6878`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    #[must_use]
    pub const fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_seconds)
    }

    #[must_use]
    pub const fn no_response_timeout(&self) -> Duration {
        Duration::from_secs(self.no_response_timeout_seconds)
    }
}

impl StreamingConfig {
    #[must_use]
    pub const fn empty_timeout(&self) -> Duration {
        Duration::from_secs(self.empty_timeout_seconds)
    }

    #[must_use]
    pub const fn first_chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.first_chunk_timeout_seconds)
    }

    #[must_use]
    pub const fn client_send_retry(&self) -> Duration {
        Duration::from_millis(self.client_send_retry_millis)
    }

    #[must_use]
    pub const fn stale_client_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_client_threshold_seconds)
    }

    #[must_use]
    pub const fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_seconds)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    ///
    /// A named config file must exist; a malformed value in either source is
    /// an error, never a silent default.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_file, None)
    }

    /// Like [`Config::load`], reading overrides from `env` instead of the
    /// process environment when given
    pub fn load_with_env(
        config_file: Option<&str>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Override with environment variables (ACEPROXY_ENGINE__HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("ACEPROXY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check every bound the proxy relies on.
    ///
    /// Returns all violations at once so a misconfigured deployment can be
    /// fixed in one pass. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.engine.port == 0 {
            errors.push("engine.port must be non-zero".to_string());
        }
        if self.engine.host.trim().is_empty() {
            errors.push("engine.host must not be empty".to_string());
        }
        if !matches!(self.engine.scheme.as_str(), "http" | "https") {
            errors.push(format!(
                "engine.scheme must be \"http\" or \"https\", got \"{}\"",
                self.engine.scheme
            ));
        }
        if self.engine.port == self.server.http_port
            && is_local_host(&self.engine.host)
            && is_local_host(&self.server.host)
        {
            errors.push("server.http_port and engine.port cannot be the same".to_string());
        }
        if self.engine.engine_timeout_seconds == 0 {
            errors.push("engine.engine_timeout_seconds must be non-zero".to_string());
        }
        if self.engine.no_response_timeout_seconds == 0 {
            errors.push("engine.no_response_timeout_seconds must be non-zero".to_string());
        }

        let s = &self.streaming;
        if s.empty_timeout_seconds == 0 {
            errors.push("streaming.empty_timeout_seconds must be non-zero".to_string());
        }
        if s.first_chunk_timeout_seconds == 0 {
            errors.push("streaming.first_chunk_timeout_seconds must be non-zero".to_string());
        }
        if !(MIN_CHUNK_SIZE_BYTES..=MAX_CHUNK_SIZE_BYTES).contains(&s.chunk_size_bytes) {
            errors.push(format!(
                "streaming.chunk_size_bytes must be within {MIN_CHUNK_SIZE_BYTES}..={MAX_CHUNK_SIZE_BYTES}, got {}",
                s.chunk_size_bytes
            ));
        }
        if s.client_queue_capacity == 0 {
            errors.push("streaming.client_queue_capacity must be at least 1".to_string());
        }
        if !CLIENT_SEND_RETRY_RANGE_MILLIS.contains(&s.client_send_retry_millis) {
            errors.push(format!(
                "streaming.client_send_retry_millis must be within {}..={}, got {}",
                CLIENT_SEND_RETRY_RANGE_MILLIS.start(),
                CLIENT_SEND_RETRY_RANGE_MILLIS.end(),
                s.client_send_retry_millis
            ));
        }
        if s.stale_client_threshold_seconds == 0 {
            errors.push("streaming.stale_client_threshold_seconds must be non-zero".to_string());
        }
        if s.stale_sweep_interval_seconds == 0 {
            errors.push("streaming.stale_sweep_interval_seconds must be non-zero".to_string());
        } else if s.stale_sweep_interval_seconds > s.stale_client_threshold_seconds {
            errors.push(
                "streaming.stale_sweep_interval_seconds must not exceed stale_client_threshold_seconds"
                    .to_string(),
            );
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0" | "::1" | "::")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.engine.port, 6878);
        assert_eq!(config.engine.engine_timeout_seconds, 15);
        assert_eq!(config.engine.no_response_timeout_seconds, 10);
        assert_eq!(config.streaming.empty_timeout_seconds, 60);
        assert_eq!(config.streaming.client_queue_capacity, 50);
        assert_eq!(config.streaming.stale_client_threshold_seconds, 30);
        assert_eq!(config.streaming.stale_sweep_interval_seconds, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                http_port: 8001,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "0.0.0.0:8001");
        assert_eq!(config.engine.base_url(), "http://localhost:6878");
    }

    #[test]
    fn test_validate_rejects_out_of_range_tuning() {
        let mut config = Config::default();
        config.streaming.chunk_size_bytes = 1024;
        config.streaming.client_send_retry_millis = 500;
        config.streaming.client_queue_capacity = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("chunk_size_bytes")));
        assert!(errors.iter().any(|e| e.contains("client_send_retry_millis")));
        assert!(errors.iter().any(|e| e.contains("client_queue_capacity")));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut config = Config::default();
        config.server.http_port = config.engine.port;

        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("cannot be the same"));
    }

    #[test]
    fn test_validate_sweep_interval_bound() {
        let mut config = Config::default();
        config.streaming.stale_sweep_interval_seconds = 45;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "engine:\n  host: engine.local\n  port: 7000\nstreaming:\n  client_queue_capacity: 10\n",
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.engine.host, "engine.local");
        assert_eq!(config.engine.port, 7000);
        assert_eq!(config.streaming.client_queue_capacity, 10);
        // Untouched sections keep their defaults
        assert_eq!(config.streaming.chunk_size_bytes, MIN_CHUNK_SIZE_BYTES);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::from_file("/nonexistent/aceproxy/config.yaml").is_err());
    }

    #[test]
    fn test_env_overrides_and_rejects_malformed_values() {
        let env = Map::from([("ACEPROXY_ENGINE__PORT".to_string(), "7001".to_string())]);
        let config = Config::load_with_env(None, Some(env)).unwrap();
        assert_eq!(config.engine.port, 7001);

        let env = Map::from([("ACEPROXY_ENGINE__PORT".to_string(), "abc".to_string())]);
        assert!(Config::load_with_env(None, Some(env)).is_err());
    }
}
