use super::distributed::DistributedRateLimiter;
use super::local::LocalRateLimiter;
use super::types::{
    Decision, PolicyName, PolicyTable, RateLimitAlgorithm, RateLimitKey, RateLimitPolicy,
    RateLimitStatus,
};
use crate::clock::Clock;
use crate::metrics;
use crate::store::CacheStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rate limiter service that picks the distributed or local path and owns
/// the fail-open policy
pub struct RateLimiterService {
    /// Store-backed limiter, absent when no store is configured
    distributed: Option<DistributedRateLimiter>,
    /// Local (in-memory) fallback used only without a store
    local: LocalRateLimiter,
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl RateLimiterService {
    /// Create a rate limiter service
    pub fn new(
        store: Option<Arc<dyn CacheStore>>,
        policies: PolicyTable,
        clock: Arc<dyn Clock>,
    ) -> Self {
        match &store {
            Some(store) => info!(
                backend = store.backend(),
                "Initializing rate limiter with shared store"
            ),
            None => warn!("Initializing rate limiter without a store, using local fallback"),
        }

        Self {
            distributed: store.map(DistributedRateLimiter::new),
            local: LocalRateLimiter::new(clock.clone()),
            policies,
            clock,
            enabled: true,
        }
    }

    /// Create a rate limiter service using only the process-local map
    pub fn local_only(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self::new(None, policies, clock)
    }

    /// Turn limiting on or off; a disabled service admits everything
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        if !enabled {
            info!("Rate limiting disabled by configuration");
        }
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether decisions are shared across instances
    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn policy(&self, name: PolicyName) -> &RateLimitPolicy {
        self.policies.get(name)
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Check the quota for `identity` and, when admitted, consume one unit.
    ///
    /// Never fails: a store error or timeout admits the request with a full
    /// quota and is logged as a warning.
    pub async fn check_and_consume(&self, identity: &str, policy: &RateLimitPolicy) -> Decision {
        let now = self.clock.now_ms();
        if !self.enabled {
            return Decision::fail_open(policy, now);
        }

        let key = RateLimitKey::new(policy, identity).to_store_key();

        let Some(distributed) = &self.distributed else {
            let decision = self.local.check(&key, policy);
            metrics::record_rate_limit_decision(policy.name.as_str(), decision.allowed);
            return decision;
        };

        let result = match policy.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                distributed.check_sliding_window(&key, policy, now).await
            }
            RateLimitAlgorithm::FixedWindow => {
                distributed.check_fixed_window(&key, policy, now).await
            }
        };

        match result {
            Ok(decision) => {
                metrics::record_rate_limit_decision(policy.name.as_str(), decision.allowed);
                decision
            }
            Err(e) => {
                warn!(
                    policy = %policy.name,
                    key = %key,
                    error = %e,
                    "Rate limit store check failed, failing open"
                );
                metrics::record_rate_limit_store_error(policy.name.as_str());
                Decision::fail_open(policy, now)
            }
        }
    }

    /// Forget the usage recorded for `identity` under `policy`
    pub async fn reset(&self, identity: &str, policy: &RateLimitPolicy) -> bool {
        let key = RateLimitKey::new(policy, identity).to_store_key();

        let Some(distributed) = &self.distributed else {
            return self.local.reset(&key);
        };

        match distributed.reset(&key).await {
            Ok(existed) => {
                info!(key = %key, existed, "Rate limit reset");
                existed
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to reset rate limit");
                false
            }
        }
    }

    /// Usage snapshot for `identity` under `policy`, `None` when nothing is
    /// recorded or the store cannot be read
    pub async fn status(&self, identity: &str, policy: &RateLimitPolicy) -> Option<RateLimitStatus> {
        let key = RateLimitKey::new(policy, identity).to_store_key();

        let Some(distributed) = &self.distributed else {
            return self.local.status(&key);
        };

        let result = match policy.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                distributed
                    .sliding_status(&key, policy, self.clock.now_ms())
                    .await
            }
            RateLimitAlgorithm::FixedWindow => distributed.fixed_status(&key).await,
        };

        match result {
            Ok(status) if status.count == 0 => {
                debug!(key = %key, "No rate limit usage recorded");
                None
            }
            Ok(status) => Some(status),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to get rate limit status");
                None
            }
        }
    }

    /// Drop rolled-over windows of the local fallback
    pub fn purge_local(&self) -> usize {
        self.local.purge_expired()
    }
}
