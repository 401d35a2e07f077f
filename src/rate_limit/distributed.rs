use super::types::{Decision, RateLimitPolicy, RateLimitStatus};
use crate::error::StoreResult;
use crate::store::CacheStore;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Store-backed rate limiter shared by every API instance.
///
/// Neither algorithm is atomic across its round trips: two requests racing
/// on the same key at the quota boundary can both observe spare capacity
/// and both be admitted. The overshoot is bounded by the number of
/// concurrent requests and is accepted in exchange for not taking a lock.
pub struct DistributedRateLimiter {
    store: Arc<dyn CacheStore>,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Sliding window: purge expired entries, count, then record on admit
    pub async fn check_sliding_window(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> StoreResult<Decision> {
        let window_ms = policy.window_ms as i64;
        let window_start = now_ms - window_ms;

        let count = self.store.zpurge_and_count(key, window_start).await?;
        let allowed = count < policy.max_requests as u64;

        if allowed {
            let member = format!("{}:{}", now_ms, Uuid::new_v4());
            self.store
                .zadd_with_pexpire(key, now_ms, &member, window_ms)
                .await?;
        }

        let used = count + u64::from(allowed);
        debug!(
            key = %key,
            allowed,
            count = used,
            limit = policy.max_requests,
            "Sliding window check"
        );

        Ok(Decision::new(
            allowed,
            policy.max_requests,
            used,
            now_ms + window_ms,
        ))
    }

    /// Fixed window: increment, then compare; the TTL is only set when the
    /// counter has none, so reads never move the window boundary
    pub async fn check_fixed_window(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> StoreResult<Decision> {
        let window_ms = policy.window_ms as i64;

        let (count, ttl_ms) = self.store.incr_with_pttl(key).await?;
        let ttl_ms = if ttl_ms < 0 {
            // First increment, or a counter left without expiry
            self.store.pexpire(key, window_ms).await?;
            window_ms
        } else {
            ttl_ms
        };

        let used = count.max(0) as u64;
        let allowed = used <= policy.max_requests as u64;
        debug!(
            key = %key,
            allowed,
            count = used,
            ttl_ms,
            limit = policy.max_requests,
            "Fixed window check"
        );

        Ok(Decision::new(
            allowed,
            policy.max_requests,
            used,
            now_ms + ttl_ms,
        ))
    }

    /// Current usage of a sliding window key
    pub async fn sliding_status(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> StoreResult<RateLimitStatus> {
        let count = self
            .store
            .zpurge_and_count(key, now_ms - policy.window_ms as i64)
            .await?;
        let entries = self.store.zmembers(key).await?;
        let ttl = self.store.pttl(key).await?;

        Ok(RateLimitStatus {
            key: key.to_string(),
            count,
            entries,
            ttl_ms: (ttl >= 0).then_some(ttl),
        })
    }

    /// Current usage of a fixed window key
    pub async fn fixed_status(&self, key: &str) -> StoreResult<RateLimitStatus> {
        let count = self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let ttl = self.store.pttl(key).await?;

        Ok(RateLimitStatus {
            key: key.to_string(),
            count,
            entries: Vec::new(),
            ttl_ms: (ttl >= 0).then_some(ttl),
        })
    }

    /// Forget all usage recorded for a key
    pub async fn reset(&self, key: &str) -> StoreResult<bool> {
        Ok(self.store.del(&[key.to_string()]).await? > 0)
    }
}
