use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named rate limit policies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    /// Unauthenticated traffic
    Public,
    /// Per user id
    Authenticated,
    /// Elevated trust
    Admin,
    /// External push source (Telegram), bursty
    Webhook,
    /// Strict, abuse-sensitive
    Payment,
    /// Brute-force mitigation for login, per IP
    Login,
}

impl PolicyName {
    pub const ALL: [PolicyName; 6] = [
        PolicyName::Public,
        PolicyName::Authenticated,
        PolicyName::Admin,
        PolicyName::Webhook,
        PolicyName::Payment,
        PolicyName::Login,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::Public => "public",
            PolicyName::Authenticated => "authenticated",
            PolicyName::Admin => "admin",
            PolicyName::Webhook => "webhook",
            PolicyName::Payment => "payment",
            PolicyName::Login => "login",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        PolicyName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AppError::UnknownPolicy(s.to_string()))
    }
}

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Ordered set of request timestamps, exact trailing-window count
    SlidingWindow,
    /// Counter with a TTL set on creation; cheaper, allows boundary bursts
    FixedWindow,
}

/// Which caller attribute a policy keys on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Authenticated user id, else client IP
    UserOrIp,
    /// Always the client IP
    IpOnly,
}

/// A validated rate limit policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub name: PolicyName,
    pub window_ms: u64,
    pub max_requests: u32,
    pub key_prefix: String,
    pub algorithm: RateLimitAlgorithm,
    pub identity: IdentitySource,
    /// Path prefixes exempt from this policy
    pub skip_paths: Vec<String>,
}

impl RateLimitPolicy {
    /// Build a policy, rejecting an empty window or a zero quota
    pub fn new(
        name: PolicyName,
        window_ms: u64,
        max_requests: u32,
        key_prefix: impl Into<String>,
        algorithm: RateLimitAlgorithm,
    ) -> Result<Self> {
        let key_prefix = key_prefix.into();
        if window_ms == 0 {
            return Err(AppError::InvalidPolicy(format!(
                "window must be > 0 for policy: {}",
                name
            )));
        }
        if max_requests == 0 {
            return Err(AppError::InvalidPolicy(format!(
                "max requests must be >= 1 for policy: {}",
                name
            )));
        }
        if key_prefix.is_empty() {
            return Err(AppError::InvalidPolicy(format!(
                "key prefix cannot be empty for policy: {}",
                name
            )));
        }

        Ok(Self {
            name,
            window_ms,
            max_requests,
            key_prefix,
            algorithm,
            identity: IdentitySource::UserOrIp,
            skip_paths: Vec::new(),
        })
    }

    pub fn with_identity(mut self, identity: IdentitySource) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_skip_paths(mut self, skip_paths: Vec<String>) -> Self {
        self.skip_paths = skip_paths;
        self
    }

    /// The built-in settings for a named policy
    pub fn default_for(name: PolicyName) -> Self {
        use RateLimitAlgorithm::*;

        let (window_ms, max_requests, prefix, algorithm) = match name {
            PolicyName::Public => (60_000, 20, "rl:public", SlidingWindow),
            PolicyName::Authenticated => (60_000, 100, "rl:auth", SlidingWindow),
            PolicyName::Admin => (60_000, 1000, "rl:admin", SlidingWindow),
            PolicyName::Webhook => (10_000, 30, "rl:webhook", SlidingWindow),
            PolicyName::Payment => (60_000, 10, "rl:payment", SlidingWindow),
            PolicyName::Login => (60_000, 5, "ratelimit:auth", FixedWindow),
        };
        let identity = match name {
            PolicyName::Login => IdentitySource::IpOnly,
            _ => IdentitySource::UserOrIp,
        };

        Self {
            name,
            window_ms,
            max_requests,
            key_prefix: prefix.to_string(),
            algorithm,
            identity,
            skip_paths: Vec::new(),
        }
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Whether `path` is exempt from this policy
    pub fn skips(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|skip| path.starts_with(skip.as_str()))
    }
}

/// Per-policy overrides read from configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub algorithm: Option<RateLimitAlgorithm>,
    #[serde(default)]
    pub skip_paths: Option<Vec<String>>,
}

/// The closed set of policies, one entry per [`PolicyName`]
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<PolicyName, RateLimitPolicy>,
}

impl PolicyTable {
    /// Apply overrides to the built-in table, validating every result
    pub fn from_overrides(overrides: &HashMap<PolicyName, PolicyOverride>) -> Result<Self> {
        let mut policies = HashMap::with_capacity(PolicyName::ALL.len());

        for name in PolicyName::ALL {
            let base = RateLimitPolicy::default_for(name);
            let policy = match overrides.get(&name) {
                Some(o) => RateLimitPolicy::new(
                    name,
                    o.window_ms.unwrap_or(base.window_ms),
                    o.max_requests.unwrap_or(base.max_requests),
                    o.key_prefix.clone().unwrap_or(base.key_prefix),
                    o.algorithm.unwrap_or(base.algorithm),
                )?
                .with_identity(base.identity)
                .with_skip_paths(o.skip_paths.clone().unwrap_or_default()),
                None => base,
            };
            policies.insert(name, policy);
        }

        Ok(Self { policies })
    }

    pub fn get(&self, name: PolicyName) -> &RateLimitPolicy {
        // from_overrides fills every name
        &self.policies[&name]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateLimitPolicy> {
        PolicyName::ALL.iter().map(move |name| self.get(*name))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            policies: PolicyName::ALL
                .into_iter()
                .map(|name| (name, RateLimitPolicy::default_for(name)))
                .collect(),
        }
    }
}

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    Ip(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{}", id),
            Identity::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// Rate limit key components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Policy scope prefix (e.g. `rl:public`)
    pub prefix: String,
    /// Opaque identity (e.g. `user:42`, `ip:10.0.0.1`)
    pub identity: String,
}

impl RateLimitKey {
    pub fn new(policy: &RateLimitPolicy, identity: &str) -> Self {
        Self {
            prefix: policy.key_prefix.clone(),
            identity: identity.to_string(),
        }
    }

    /// Convert to a store key
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.prefix, self.identity)
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Total limit
    pub limit: u32,
    /// Remaining requests in the current window, never negative
    pub remaining: u32,
    /// Advisory epoch ms by which capacity frees up
    pub reset_at_ms: i64,
}

impl Decision {
    pub fn new(allowed: bool, limit: u32, used: u64, reset_at_ms: i64) -> Self {
        Self {
            allowed,
            limit,
            remaining: (limit as u64).saturating_sub(used) as u32,
            reset_at_ms,
        }
    }

    /// The decision returned when the store cannot be consulted
    pub fn fail_open(policy: &RateLimitPolicy, now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit: policy.max_requests,
            remaining: policy.max_requests,
            reset_at_ms: now_ms + policy.window_ms as i64,
        }
    }

    /// Seconds until retry makes sense, at least 1
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let wait_ms = (self.reset_at_ms - now_ms).max(0) as u64;
        wait_ms.div_ceil(1000).max(1)
    }
}

/// Snapshot of one key's usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub count: u64,
    /// Sliding window member tokens, oldest first
    pub entries: Vec<String>,
    /// Remaining TTL in ms, when the key has one
    pub ttl_ms: Option<i64>,
}
