//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{RateLimiterConfig, DEFAULT_STORE_TIMEOUT};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Which bucket store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis node or cluster
    #[default]
    Redis,
    /// Process-local buckets, for development and tests
    Memory,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis URLs; cluster seed nodes when `cluster` is set
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,

    /// Connect in cluster mode
    #[serde(default)]
    pub cluster: bool,

    /// Bound on a single bucket evaluation
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            urls: default_urls(),
            cluster: false,
            timeout: default_timeout(),
        }
    }
}

fn default_urls() -> Vec<String> {
    vec!["redis://127.0.0.1:6379".to_string()]
}

fn default_timeout() -> Duration {
    DEFAULT_STORE_TIMEOUT
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Static overrides by descriptor id
    #[serde(default)]
    pub limits: HashMap<String, RateLimiterConfig>,

    /// Path to the dynamic configuration file
    #[serde(default)]
    pub dynamic_config_path: Option<PathBuf>,

    /// How often the dynamic configuration file is re-read
    #[serde(default = "default_reload_interval", with = "humantime_serde")]
    pub dynamic_reload_interval: Duration,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            dynamic_config_path: None,
            dynamic_reload_interval: default_reload_interval(),
        }
    }
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(10)
}

/// Flat environment overrides, e.g. `TURNSTILE_STORE_TIMEOUT=250ms`.
///
/// Read separately from the file because descriptor ids in
/// `rate_limiting.limits` are case-sensitive.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    grpc_addr: Option<SocketAddr>,
    store_backend: Option<StoreBackend>,
    /// Comma-separated
    store_urls: Option<String>,
    store_cluster: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    store_timeout: Option<Duration>,
    dynamic_config_path: Option<PathBuf>,
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let overrides: EnvOverrides = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.apply(overrides);

        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    fn apply(&mut self, overrides: EnvOverrides) {
        if let Some(addr) = overrides.grpc_addr {
            self.server.grpc_addr = addr;
        }
        if let Some(backend) = overrides.store_backend {
            self.store.backend = backend;
        }
        if let Some(urls) = overrides.store_urls {
            self.store.urls = urls.split(',').map(|u| u.trim().to_string()).collect();
        }
        if let Some(cluster) = overrides.store_cluster {
            self.store.cluster = cluster;
        }
        if let Some(timeout) = overrides.store_timeout {
            self.store.timeout = timeout;
        }
        if let Some(path) = overrides.dynamic_config_path {
            self.rate_limiting.dynamic_config_path = Some(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.grpc_addr.port(), 8081);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.timeout, DEFAULT_STORE_TIMEOUT);
        assert!(config.rate_limiting.limits.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  grpc_addr: 0.0.0.0:9000
store:
  backend: memory
  timeout: 250ms
rate_limiting:
  limits:
    verify:
      bucket_size: 10
      permit_regeneration_interval: 1s
  dynamic_config_path: /etc/turnstile/dynamic.yml
  dynamic_reload_interval: 30s
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout, Duration::from_millis(250));
        assert_eq!(
            config.rate_limiting.limits["verify"],
            RateLimiterConfig::new(10, Duration::from_secs(1))
        );
        assert_eq!(
            config.rate_limiting.dynamic_config_path,
            Some(PathBuf::from("/etc/turnstile/dynamic.yml"))
        );
        assert_eq!(config.rate_limiting.dynamic_reload_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_static_limit_fails_to_parse() {
        let yaml = r#"
rate_limiting:
  limits:
    verify:
      bucket_size: 0
      permit_regeneration_interval: 1s
"#;
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = TurnstileConfig::default();
        config.apply(EnvOverrides {
            store_backend: Some(StoreBackend::Memory),
            store_urls: Some("redis://a:6379, redis://b:6379".to_string()),
            store_cluster: Some(true),
            store_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.urls, vec!["redis://a:6379", "redis://b:6379"]);
        assert!(config.store.cluster);
        assert_eq!(config.store.timeout, Duration::from_millis(50));
        assert_eq!(config.server.grpc_addr.port(), 8081);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            TurnstileConfig::from_file("/nonexistent/turnstile.yaml"),
            Err(TurnstileError::Io(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "store:\n  backend: memory\nrate_limiting:\n  limits:\n    rateLimitReset:\n      bucket_size: 3\n      permit_regeneration_interval: 1m"
        )
        .unwrap();

        let config = TurnstileConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(
            config.rate_limiting.limits["rateLimitReset"],
            RateLimiterConfig::new(3, Duration::from_secs(60))
        );
    }
}
