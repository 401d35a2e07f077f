use crate::cache::{CacheTier, DEFAULT_MAX_BODY_BYTES};
use crate::error::{AppError, Result};
use crate::rate_limit::types::{PolicyName, PolicyOverride, PolicyTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable overriding `store.url`
pub const REDIS_URL_ENV: &str = "REDIS_URL";
/// Environment variable overriding `server.host:server.port`
pub const BIND_ENV: &str = "CLUBGUARD_BIND";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared cache store
    #[serde(default)]
    pub store: StoreConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Mount the `/internal` admin routes
    #[serde(default)]
    pub expose_admin: bool,
    /// Serve Prometheus metrics on `/metrics`
    #[serde(default = "default_true")]
    pub metrics: bool,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis, required for multi-instance deployments
    Redis,
    /// Process-local map, single instance only
    Memory,
    /// No store: local rate limit fallback, no response cache
    None,
}

/// Cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Redis connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Upper bound on every store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Enable rate limiting globally
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-policy overrides of the built-in table
    #[serde(default)]
    pub policies: HashMap<PolicyName, PolicyOverride>,
}

impl RateLimitingConfig {
    /// Built-in policy table with the configured overrides applied
    pub fn policy_table(&self) -> Result<PolicyTable> {
        PolicyTable::from_overrides(&self.policies)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable caching
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TTL overrides in seconds, per tier
    #[serde(default)]
    pub tiers: HashMap<CacheTier, u64>,
    /// Largest response body that is cached
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact format
    #[serde(default)]
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_log_filter() -> String {
    "clubguard=debug,tower_http=debug".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
            expose_admin: false,
            metrics: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: Some("redis://127.0.0.1:6379".to_string()),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policies: HashMap::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: HashMap::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Apply `REDIS_URL` and `CLUBGUARD_BIND` from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(REDIS_URL_ENV).ok(),
            std::env::var(BIND_ENV).ok(),
        )
    }

    fn apply_overrides(&mut self, redis_url: Option<String>, bind: Option<String>) -> Result<()> {
        if let Some(url) = redis_url.filter(|url| !url.is_empty()) {
            info!("Store URL taken from {}", REDIS_URL_ENV);
            self.store.url = Some(url);
        }

        if let Some(bind) = bind.filter(|bind| !bind.is_empty()) {
            let (host, port) = bind.rsplit_once(':').ok_or_else(|| {
                AppError::Config(format!("{} must be host:port, got '{}'", BIND_ENV, bind))
            })?;
            self.server.port = port.parse().map_err(|_| {
                AppError::Config(format!("Invalid port in {}: '{}'", BIND_ENV, port))
            })?;
            self.server.host = host.to_string();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(AppError::Config("Server host cannot be empty".to_string()));
        }
        if self.server.timeout_secs == 0 {
            return Err(AppError::Config(
                "Server timeout must be > 0".to_string(),
            ));
        }

        if self.store.timeout_ms == 0 {
            return Err(AppError::Config("Store timeout must be > 0".to_string()));
        }
        if self.store.backend == StoreBackend::Redis {
            let url = self.store.url.as_deref().unwrap_or_default();
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(AppError::Config(format!(
                    "Store URL must start with redis:// or rediss://, got '{}'",
                    url
                )));
            }
        }

        // Surfaces InvalidPolicy for zero windows or quotas
        self.rate_limiting.policy_table()?;

        for (tier, ttl) in &self.cache.tiers {
            if *ttl == 0 {
                return Err(AppError::Config(format!(
                    "Cache TTL must be > 0 for tier: {}",
                    tier
                )));
            }
        }
        if self.cache.max_body_bytes == 0 {
            return Err(AppError::Config(
                "Cache max_body_bytes must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Address the server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
