//! Response cache
//!
//! Memoizes GET responses in the shared store, scoped by tier:
//!
//! - `hot:` / `public:` / `static:` entries are shared by every caller
//! - `user:<id>:` entries belong to one authenticated caller and are never
//!   served to anyone else
//!
//! Entries are never updated in place; mutations elsewhere in the system
//! remove them by key prefix (see [`invalidation`]). Every store failure
//! degrades to a miss so the wrapped request is recomputed.

pub mod invalidation;
pub mod keys;
pub mod middleware;

pub use invalidation::{CacheAction, InvalidationContext, InvalidationTarget};
pub use keys::{build_key, is_cache_keyspace, CacheTier};
pub use middleware::{cache_middleware, CacheMiddleware};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::metrics;
use crate::store::{prefix_pattern, CacheStore};
use futures::future::join_all;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default cap on a response body considered for caching
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Cached response entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub cached_at_ms: i64,
    pub etag: String,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: Option<String>, body: String, now_ms: i64) -> Self {
        let etag = compute_etag(body.as_bytes());
        Self {
            status,
            content_type,
            body,
            cached_at_ms: now_ms,
            etag,
        }
    }

    /// Whole seconds since the entry was stored
    pub fn age_secs(&self, now_ms: i64) -> u64 {
        ((now_ms - self.cached_at_ms).max(0) / 1000) as u64
    }
}

/// Quoted hex SHA-256 of a body
pub fn compute_etag(body: &[u8]) -> String {
    format!("\"{:x}\"", Sha256::digest(body))
}

/// Key counts per tier
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_keys: u64,
    pub by_tier: BTreeMap<String, u64>,
}

/// Store-backed response cache
pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
    ttls: HashMap<CacheTier, Duration>,
    max_body_bytes: usize,
    enabled: bool,
}

impl ResponseCache {
    /// Create a response cache; without a store every lookup misses
    pub fn new(store: Option<Arc<dyn CacheStore>>, clock: Arc<dyn Clock>) -> Self {
        if store.is_none() {
            warn!("Response cache has no store, caching disabled");
        }

        Self {
            store,
            clock,
            ttls: CacheTier::ALL
                .into_iter()
                .map(|tier| (tier, tier.default_ttl()))
                .collect(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            enabled: true,
        }
    }

    /// Apply the `cache` configuration section
    pub fn with_config(mut self, config: &CacheConfig) -> Self {
        for (tier, secs) in &config.tiers {
            self.ttls.insert(*tier, Duration::from_secs(*secs));
        }
        self.max_body_bytes = config.max_body_bytes;
        self.enabled = config.enabled;

        info!(
            enabled = self.is_enabled(),
            max_body_bytes = self.max_body_bytes,
            "Initialized response cache"
        );
        self
    }

    /// Whether lookups can ever hit
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.store.is_some()
    }

    pub fn ttl(&self, tier: CacheTier) -> Duration {
        self.ttls
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_ttl())
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref().filter(|_| self.enabled)
    }

    /// Read and decode an entry; store errors and undecodable entries are
    /// misses
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store()?;

        let raw = match store.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                metrics::record_cache_store_error("get");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                if let Err(e) = store.del(&[key.to_string()]).await {
                    debug!(key = %key, error = %e, "Failed to drop undecodable cache entry");
                }
                None
            }
        }
    }

    /// Store an entry for `ttl`; returns whether it was written
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let Some(store) = self.store() else {
            return false;
        };

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        match store.set_ex(key, &raw, ttl).await {
            Ok(()) => {
                debug!(key = %key, ttl_secs = ttl.as_secs(), "Response cached");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write cache entry");
                metrics::record_cache_store_error("set");
                false
            }
        }
    }

    /// Remove one entry
    pub async fn invalidate(&self, key: &str) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        if !is_cache_keyspace(key) {
            warn!(key = %key, "Refusing to invalidate a key outside the cache tiers");
            return false;
        }

        match store.del(&[key.to_string()]).await {
            Ok(removed) => {
                info!(key = %key, removed, "Cache invalidated");
                metrics::record_cache_invalidation(removed);
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to invalidate cache");
                metrics::record_cache_store_error("del");
                false
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> u64 {
        self.invalidate_matching(&prefix_pattern(prefix)).await
    }

    /// Tags are structural: a tag is the key prefix its entries share
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        self.invalidate_by_prefix(tag).await
    }

    /// Remove every entry whose key matches a glob `pattern`.
    ///
    /// The pattern must start with a literal `<tier>:`; the store also holds
    /// rate limit counters, which are never touched from here.
    pub async fn invalidate_matching(&self, pattern: &str) -> u64 {
        let Some(store) = self.store() else {
            return 0;
        };
        if !is_cache_keyspace(pattern) {
            warn!(pattern = %pattern, "Refusing to invalidate outside the cache tiers");
            return 0;
        }

        let keys = match store.scan_keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Failed to enumerate cache keys");
                metrics::record_cache_store_error("scan");
                return 0;
            }
        };
        if keys.is_empty() {
            debug!(pattern = %pattern, "No cache entries to invalidate");
            return 0;
        }

        match store.del(&keys).await {
            Ok(removed) => {
                info!(pattern = %pattern, count = removed, "Cache invalidated by pattern");
                metrics::record_cache_invalidation(removed);
                removed
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Failed to delete cache keys");
                metrics::record_cache_store_error("del");
                0
            }
        }
    }

    /// Remove every cached response of every tier
    pub async fn clear_all(&self) -> u64 {
        let prefixes = CacheTier::ALL.map(|tier| format!("{}:", tier));
        let removed: u64 = join_all(
            prefixes
                .iter()
                .map(|prefix| self.invalidate_by_prefix(prefix)),
        )
        .await
        .into_iter()
        .sum();
        warn!(count = removed, "All response cache entries cleared");
        removed
    }

    /// Key counts per tier, `None` without a store or when it cannot be read
    pub async fn stats(&self) -> Option<CacheStats> {
        let store = self.store()?;

        let mut by_tier = BTreeMap::new();
        for tier in CacheTier::ALL {
            let pattern = prefix_pattern(&format!("{}:", tier));
            match store.scan_keys(&pattern).await {
                Ok(keys) => {
                    by_tier.insert(tier.to_string(), keys.len() as u64);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to get cache stats");
                    metrics::record_cache_store_error("scan");
                    return None;
                }
            }
        }

        Some(CacheStats {
            total_keys: by_tier.values().sum(),
            by_tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{StoreError, StoreResult};
    use crate::rate_limit::{PolicyName, PolicyTable, RateLimiterService};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Store whose every call fails, as if Redis timed out
    struct TimedOutStore;

    #[async_trait]
    impl CacheStore for TimedOutStore {
        fn backend(&self) -> &'static str {
            "timed-out"
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
        async fn del(&self, _: &[String]) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
        async fn incr_with_pttl(&self, _: &str) -> StoreResult<(i64, i64)> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn pexpire(&self, _: &str, _: i64) -> StoreResult<bool> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn pttl(&self, _: &str) -> StoreResult<i64> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn zpurge_and_count(&self, _: &str, _: i64) -> StoreResult<u64> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn zadd_with_pexpire(&self, _: &str, _: i64, _: &str, _: i64) -> StoreResult<()> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn zmembers(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
        async fn scan_keys(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Timeout(Duration::from_millis(250)))
        }
    }

    fn cache() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(clock.clone()));
        (ResponseCache::new(Some(store), clock.clone()), clock)
    }

    #[test]
    fn test_etag_is_quoted_sha256() {
        let etag = compute_etag(b"hello");
        assert_eq!(
            etag,
            "\"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\""
        );
    }

    #[test]
    fn test_cached_response_age() {
        let cached = CachedResponse::new(200, None, "{}".into(), 10_000);
        assert_eq!(cached.age_secs(10_999), 0);
        assert_eq!(cached.age_secs(12_000), 2);
        assert_eq!(cached.age_secs(5_000), 0);
    }

    #[tokio::test]
    async fn test_round_trip_and_expiry() {
        let (cache, clock) = cache();
        let value = json!({"items": [1, 2, 3], "next": null, "title": "Дыхание"});

        assert!(cache.set("hot:GET:/api/v1/ratings", &value, Duration::from_secs(300)).await);
        let cached: serde_json::Value = cache.get("hot:GET:/api/v1/ratings").await.unwrap();
        assert_eq!(cached, value);

        clock.advance(300_000);
        assert!(cache
            .get::<serde_json::Value>("hot:GET:/api/v1/ratings")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_dropped() {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(clock.clone()));
        let cache = ResponseCache::new(Some(store.clone()), clock);

        store
            .set_ex("hot:GET:/x", "not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get::<CachedResponse>("hot:GET:/x").await.is_none());
        assert!(store.get("hot:GET:/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_invalidation_is_scoped() {
        let (cache, _clock) = cache();
        let ttl = Duration::from_secs(60);

        cache.set("user:A:GET:/api/v1/me", &1, ttl).await;
        cache.set("user:A:GET:/api/v1/shop", &2, ttl).await;
        cache.set("user:AB:GET:/api/v1/me", &3, ttl).await;
        cache.set("user:B:GET:/api/v1/me", &4, ttl).await;

        assert_eq!(cache.invalidate_by_prefix("user:A:").await, 2);
        assert!(cache.get::<i32>("user:A:GET:/api/v1/me").await.is_none());
        assert_eq!(cache.get::<i32>("user:AB:GET:/api/v1/me").await, Some(3));
        assert_eq!(cache.get::<i32>("user:B:GET:/api/v1/me").await, Some(4));
    }

    #[tokio::test]
    async fn test_prefix_with_glob_characters_matches_literally() {
        let (cache, _clock) = cache();
        let ttl = Duration::from_secs(60);

        cache.set("hot:GET:/api/v1/ratings:q:a=*", &1, ttl).await;
        cache.set("hot:GET:/api/v1/ratings:q:a=b", &2, ttl).await;

        assert_eq!(cache.invalidate_by_tag("hot:GET:/api/v1/ratings:q:a=*").await, 1);
        assert_eq!(cache.get::<i32>("hot:GET:/api/v1/ratings:q:a=b").await, Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_clear_and_stats() {
        let (cache, _clock) = cache();
        let ttl = Duration::from_secs(60);

        cache.set("hot:GET:/a", &1, ttl).await;
        cache.set("public:GET:/b", &1, ttl).await;
        cache.set("user:1:GET:/c", &1, ttl).await;
        cache.set("rl:public:ip:1.1.1.1", &1, ttl).await;

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.by_tier["hot"], 1);
        assert_eq!(stats.by_tier["static"], 0);

        assert!(cache.invalidate("hot:GET:/a").await);
        assert_eq!(cache.clear_all().await, 2);
        assert_eq!(cache.stats().await.unwrap().total_keys, 0);

        // Rate limit keys share the store but are not cache entries
        assert_eq!(cache.get::<i32>("rl:public:ip:1.1.1.1").await, Some(1));
    }

    #[tokio::test]
    async fn test_without_store_everything_misses() {
        let cache = ResponseCache::new(None, Arc::new(ManualClock::new(0)));
        assert!(!cache.is_enabled());
        assert!(!cache.set("hot:GET:/a", &1, Duration::from_secs(5)).await);
        assert!(cache.get::<i32>("hot:GET:/a").await.is_none());
        assert_eq!(cache.invalidate_by_prefix("hot:").await, 0);
        assert!(cache.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_config_overrides() {
        let (cache, _clock) = cache();
        let mut config = CacheConfig::default();
        config.tiers.insert(CacheTier::Hot, 30);
        config.max_body_bytes = 512;

        let cache = cache.with_config(&config);
        assert_eq!(cache.ttl(CacheTier::Hot), Duration::from_secs(30));
        assert_eq!(cache.ttl(CacheTier::User), Duration::from_secs(60));
        assert_eq!(cache.max_body_bytes(), 512);

        config.enabled = false;
        let cache = cache.with_config(&config);
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_miss() {
        let cache = ResponseCache::new(
            Some(Arc::new(TimedOutStore)),
            Arc::new(ManualClock::new(0)),
        );
        assert!(cache.is_enabled());

        assert!(cache.get::<i32>("hot:GET:/api/v1/ratings").await.is_none());
        assert!(!cache.set("hot:GET:/api/v1/ratings", &1, Duration::from_secs(60)).await);
        assert!(!cache.invalidate("hot:GET:/api/v1/ratings").await);
        assert_eq!(cache.invalidate_by_prefix("user:1:").await, 0);
        assert_eq!(cache.clear_all().await, 0);
        assert!(cache.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_never_touches_rate_limit_counters() {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(clock.clone()));
        let cache = ResponseCache::new(Some(store.clone()), clock.clone());
        let limiter = RateLimiterService::new(Some(store.clone()), PolicyTable::default(), clock);
        let login = limiter.policy(PolicyName::Login).clone();
        let public = limiter.policy(PolicyName::Public).clone();

        for _ in 0..login.max_requests {
            assert!(limiter.check_and_consume("ip:1.1.1.1", &login).await.allowed);
        }
        assert!(!limiter.check_and_consume("ip:1.1.1.1", &login).await.allowed);
        limiter.check_and_consume("ip:1.1.1.1", &public).await;
        cache.set("hot:GET:/api/v1/ratings", &1, Duration::from_secs(60)).await;

        for prefix in ["", "r", "rl:", "rl:public:", "ratelimit:auth:", "hot"] {
            assert_eq!(cache.invalidate_by_prefix(prefix).await, 0, "prefix {:?}", prefix);
        }
        assert_eq!(cache.invalidate_matching("*").await, 0);
        assert!(!cache.invalidate("ratelimit:auth:ip:1.1.1.1").await);

        assert!(!limiter.check_and_consume("ip:1.1.1.1", &login).await.allowed);
        assert_eq!(
            limiter.status("ip:1.1.1.1", &public).await.map(|s| s.count),
            Some(1)
        );
        assert_eq!(cache.get::<i32>("hot:GET:/api/v1/ratings").await, Some(1));

        assert_eq!(cache.clear_all().await, 1);
        assert!(!limiter.check_and_consume("ip:1.1.1.1", &login).await.allowed);
    }
}
