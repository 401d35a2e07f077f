use super::types::{Decision, RateLimitPolicy, RateLimitStatus};
use crate::clock::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    reset_at_ms: i64,
}

/// Process-local fixed window limiter.
///
/// Only used when no shared store is configured. Counts are not shared
/// between instances, so the effective limit scales with the number of
/// processes.
pub struct LocalRateLimiter {
    windows: DashMap<String, LocalWindow>,
    clock: Arc<dyn Clock>,
}

impl LocalRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Count one request against `key`
    pub fn check(&self, key: &str, policy: &RateLimitPolicy) -> Decision {
        let now = self.clock.now_ms();
        let window_ms = policy.window_ms as i64;

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("Creating local rate limit window for key: {}", key);
                LocalWindow {
                    count: 0,
                    reset_at_ms: now + window_ms,
                }
            });

        if window.reset_at_ms <= now {
            *window = LocalWindow {
                count: 0,
                reset_at_ms: now + window_ms,
            };
        }
        window.count += 1;

        let allowed = window.count <= policy.max_requests as u64;
        if !allowed {
            warn!("Local rate limit exceeded for key: {}", key);
        }

        Decision::new(allowed, policy.max_requests, window.count, window.reset_at_ms)
    }

    pub fn status(&self, key: &str) -> Option<RateLimitStatus> {
        let now = self.clock.now_ms();
        self.windows
            .get(key)
            .filter(|w| w.reset_at_ms > now)
            .map(|w| RateLimitStatus {
                key: key.to_string(),
                count: w.count,
                entries: Vec::new(),
                ttl_ms: Some(w.reset_at_ms - now),
            })
    }

    pub fn reset(&self, key: &str) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Drop windows that have already rolled over
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();
        self.windows.retain(|_, w| w.reset_at_ms > now);
        before.saturating_sub(self.windows.len())
    }

    /// Get the number of tracked windows (for testing/monitoring)
    pub fn active_windows(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::types::{PolicyName, RateLimitAlgorithm};

    fn policy(max: u32) -> RateLimitPolicy {
        RateLimitPolicy::new(
            PolicyName::Public,
            60_000,
            max,
            "rl:test",
            RateLimitAlgorithm::SlidingWindow,
        )
        .unwrap()
    }

    #[test]
    fn test_local_rate_limiter_denies_over_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = LocalRateLimiter::new(clock);
        let policy = policy(5);

        for i in 0..5 {
            let decision = limiter.check("ip:192.168.1.2", &policy);
            assert!(decision.allowed, "Request {} should be allowed", i);
        }

        let decision = limiter.check("ip:192.168.1.2", &policy);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at_ms, 60_000);
    }

    #[test]
    fn test_local_rate_limiter_different_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = LocalRateLimiter::new(clock);
        let policy = policy(2);

        for _ in 0..2 {
            assert!(limiter.check("ip:192.168.1.1", &policy).allowed);
        }
        assert!(!limiter.check("ip:192.168.1.1", &policy).allowed);
        assert!(limiter.check("ip:192.168.1.2", &policy).allowed);

        assert_eq!(limiter.active_windows(), 2);
    }

    #[test]
    fn test_local_rate_limiter_rollover() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = LocalRateLimiter::new(clock.clone());
        let policy = policy(1);

        assert!(limiter.check("user:1", &policy).allowed);
        assert!(!limiter.check("user:1", &policy).allowed);

        clock.advance(60_000);
        assert!(limiter.status("user:1").is_none());
        let decision = limiter.check("user:1", &policy);
        assert!(decision.allowed);
        assert_eq!(decision.reset_at_ms, 120_000);
    }

    #[test]
    fn test_local_status_reset_and_purge() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = LocalRateLimiter::new(clock.clone());
        let policy = policy(10);

        limiter.check("a", &policy);
        limiter.check("a", &policy);
        limiter.check("b", &policy);

        let status = limiter.status("a").unwrap();
        assert_eq!(status.count, 2);
        assert_eq!(status.ttl_ms, Some(60_000));

        assert!(limiter.reset("b"));
        assert!(!limiter.reset("b"));

        clock.advance(60_000);
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.active_windows(), 0);
    }
}
