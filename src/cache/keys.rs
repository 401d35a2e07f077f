use crate::error::AppError;
use crate::store::escape_glob;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Route prefix shared by every cached API endpoint
pub const API_PREFIX: &str = "/api/v1";

/// Cache tier: TTL and key scope of a family of cached endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Frequently read shared data (leaderboards, ratings)
    Hot,
    /// Per-caller data, keyed by the authenticated user
    User,
    /// Shared data that rarely changes
    Public,
    /// Static content, query string ignored
    Static,
}

impl CacheTier {
    pub const ALL: [CacheTier; 4] = [
        CacheTier::Hot,
        CacheTier::User,
        CacheTier::Public,
        CacheTier::Static,
    ];

    /// Key prefix of the tier
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Hot => "hot",
            CacheTier::User => "user",
            CacheTier::Public => "public",
            CacheTier::Static => "static",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheTier::Hot => Duration::from_secs(300),
            CacheTier::User => Duration::from_secs(60),
            CacheTier::Public => Duration::from_secs(1800),
            CacheTier::Static => Duration::from_secs(3600),
        }
    }

    pub fn includes_query(&self) -> bool {
        !matches!(self, CacheTier::Static)
    }

    pub fn includes_user(&self) -> bool {
        matches!(self, CacheTier::User)
    }

    /// `Cache-Control` value advertised for responses of this tier
    pub fn cache_control(&self, ttl: Duration) -> String {
        let visibility = if self.includes_user() {
            "private"
        } else {
            "public"
        };
        format!("{}, max-age={}", visibility, ttl.as_secs())
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheTier {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown cache tier: {}", s)))
    }
}

/// Build the store key of a request.
///
/// Layout: `<tier>[:<user_id>]:<METHOD>:<path>[:q:<k=v&...>]` with query
/// pairs sorted by name. Returns `None` for a user-tier request without a
/// user, which must never be cached.
pub fn build_key(
    tier: CacheTier,
    method: &str,
    path: &str,
    query: Option<&str>,
    user_id: Option<&str>,
) -> Option<String> {
    let mut key = String::from(tier.as_str());

    if tier.includes_user() {
        let user_id = user_id.filter(|id| !id.is_empty())?;
        key.push(':');
        key.push_str(&encode_user_id(user_id));
    }

    key.push(':');
    key.push_str(&method.to_ascii_uppercase());
    key.push(':');
    key.push_str(path);

    if tier.includes_query() {
        if let Some(query) = query.map(normalize_query).filter(|q| !q.is_empty()) {
            key.push_str(":q:");
            key.push_str(&query);
        }
    }

    Some(key)
}

/// Sort query pairs by name so equivalent URLs share a key
fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode `%` and `:` so a user id is always exactly one key segment
pub fn encode_user_id(user_id: &str) -> Cow<'_, str> {
    if !user_id.contains(|c| c == ':' || c == '%') {
        return Cow::Borrowed(user_id);
    }

    let mut encoded = String::with_capacity(user_id.len() + 4);
    for c in user_id.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            ':' => encoded.push_str("%3A"),
            c => encoded.push(c),
        }
    }
    Cow::Owned(encoded)
}

/// Whether a key, prefix or glob pattern is confined to a cache tier's
/// keyspace, i.e. starts with a literal `<tier>:`
pub fn is_cache_keyspace(pattern: &str) -> bool {
    CacheTier::ALL.iter().any(|tier| {
        pattern
            .strip_prefix(tier.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    })
}

/// Every entry cached for one user
pub fn user_scope_prefix(user_id: &str) -> String {
    format!("{}:{}:", CacheTier::User, encode_user_id(user_id))
}

/// One user's cached GETs under `path`
pub fn user_route_prefix(user_id: &str, path: &str) -> String {
    format!(
        "{}:{}:GET:{}",
        CacheTier::User,
        encode_user_id(user_id),
        path
    )
}

/// Glob matching every user's cached GETs under `path`
pub fn user_route_pattern(path: &str) -> String {
    format!("{}:*:GET:{}*", CacheTier::User, escape_glob(path))
}

/// Shared tier GETs under `path`
pub fn shared_route_prefix(tier: CacheTier, path: &str) -> String {
    format!("{}:GET:{}", tier, path)
}
