//! Shared cache store
//!
//! Both the rate limiter and the response cache talk to the store through
//! the [`CacheStore`] trait, which exposes the handful of primitives they
//! need: plain values with expiry, atomic counters, ordered sets scored by
//! timestamp, and pattern-based key enumeration.
//!
//! Backends:
//!
//! - [`RedisStore`]: the production backend, shared by every API process.
//!   Multi-command operations are sent as pipelines and every call is
//!   bounded by a timeout.
//! - [`MemoryStore`]: a process-local backend for development and
//!   single-instance deployments, also used by the test suite.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Primitives consumed from the shared key-value store
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name used in logs and health output
    fn backend(&self) -> &'static str;

    /// Check the store is reachable
    async fn ping(&self) -> StoreResult<()>;

    /// Read a plain value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a plain value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Increment a counter and read its remaining TTL in one round trip.
    ///
    /// The TTL follows Redis `PTTL` conventions: `-1` when the key has no
    /// expiry, `-2` when it does not exist.
    async fn incr_with_pttl(&self, key: &str) -> StoreResult<(i64, i64)>;

    /// Set the expiry of an existing key
    async fn pexpire(&self, key: &str, ttl_ms: i64) -> StoreResult<bool>;

    /// Remaining TTL in milliseconds (`PTTL` conventions)
    async fn pttl(&self, key: &str) -> StoreResult<i64>;

    /// Drop ordered-set members scored below `min_score`, then count the rest
    async fn zpurge_and_count(&self, key: &str, min_score: i64) -> StoreResult<u64>;

    /// Add a scored member and reset the expiry of the whole set
    async fn zadd_with_pexpire(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl_ms: i64,
    ) -> StoreResult<()>;

    /// All members of an ordered set, lowest score first
    async fn zmembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Enumerate keys matching a glob pattern
    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Drop expired entries eagerly; backends with native expiry do nothing
    fn evict_expired(&self) -> usize {
        0
    }
}

/// Escape glob metacharacters so `prefix` matches literally
pub fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Glob pattern matching every key that starts with `prefix`
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{}*", escape_glob(prefix))
}

/// Build the store selected by configuration.
///
/// Returns `None` when no store is configured, or when Redis cannot be
/// reached at startup; callers then run on their local fallbacks.
pub async fn connect(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Option<Arc<dyn CacheStore>> {
    match config.backend {
        StoreBackend::None => {
            warn!("No cache store configured - rate limiting falls back to local map, caching disabled");
            None
        }
        StoreBackend::Memory => {
            info!("Using in-memory cache store (single instance only)");
            Some(Arc::new(MemoryStore::new(clock)))
        }
        StoreBackend::Redis => {
            let url = config.url.as_deref().unwrap_or_default();
            match RedisStore::connect(url, config.timeout()).await {
                Ok(store) => {
                    info!(timeout_ms = config.timeout_ms, "Connected to Redis cache store");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    warn!(
                        "Redis unavailable at startup: {}, falling back to local rate limiting",
                        e
                    );
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("user:42:"), "user:42:");
        assert_eq!(escape_glob("hot:GET:/a?b=*"), "hot:GET:/a\\?b=\\*");
        assert_eq!(escape_glob("x[1]\\"), "x\\[1\\]\\\\");
    }

    #[test]
    fn test_prefix_pattern() {
        assert_eq!(prefix_pattern("user:A"), "user:A*");
    }

    #[tokio::test]
    async fn test_connect_none_backend() {
        let config = StoreConfig {
            backend: StoreBackend::None,
            url: None,
            timeout_ms: 100,
        };
        let store = connect(&config, Arc::new(crate::clock::SystemClock)).await;
        assert!(store.is_none());
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            url: None,
            timeout_ms: 100,
        };
        let store = connect(&config, Arc::new(crate::clock::SystemClock))
            .await
            .expect("memory store");
        assert_eq!(store.backend(), "memory");
        assert!(store.ping().await.is_ok());
    }
}
