//! Rate limiting module
//!
//! Per-policy request quotas shared across API processes through the cache
//! store, with a process-local fallback when no store is configured:
//!
//! - **Sliding Window**: one ordered-set entry per admitted request, used by
//!   the general policies (`public`, `authenticated`, `admin`, `webhook`,
//!   `payment`)
//! - **Fixed Window**: a counter whose expiry is anchored on the first
//!   request of the window, used by the `login` policy
//!
//! # Features
//!
//! - Keyed by authenticated user when available, otherwise by client IP
//! - Fails open when the store errors or times out
//! - Rate limit headers in responses (`X-RateLimit-*`)
//! - Status and reset operations for support tooling
//!
//! # Example
//!
//! ```rust,no_run
//! use clubguard::clock::SystemClock;
//! use clubguard::rate_limit::{PolicyName, PolicyTable, RateLimiterService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service =
//!         RateLimiterService::local_only(PolicyTable::default(), Arc::new(SystemClock));
//!     let policy = service.policy(PolicyName::Login).clone();
//!
//!     let decision = service.check_and_consume("ip:203.0.113.7", &policy).await;
//!     assert!(decision.allowed);
//! }
//! ```

pub mod distributed;
pub mod local;
pub mod middleware;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use distributed::DistributedRateLimiter;
pub use local::LocalRateLimiter;
pub use middleware::{add_rate_limit_headers, rate_limit_middleware, RateLimitMiddleware};
pub use service::RateLimiterService;
pub use types::{
    Decision, Identity, IdentitySource, PolicyName, PolicyOverride, PolicyTable,
    RateLimitAlgorithm, RateLimitKey, RateLimitPolicy, RateLimitStatus,
};
