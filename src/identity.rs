//! Caller identity resolution shared by the rate limiter and the cache.

use crate::rate_limit::types::{Identity, IdentitySource};
use axum::http::{Extensions, HeaderMap};

/// Proxy headers carrying the client address, in preference order
pub const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Authenticated caller, inserted into request extensions by the host
/// application's auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Client address from proxy headers, `unknown` when none is usable.
///
/// `x-forwarded-for` may hold a chain; the first hop is the client.
pub fn client_ip(headers: &HeaderMap) -> String {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Who the request counts against
pub fn resolve_identity(
    source: IdentitySource,
    headers: &HeaderMap,
    extensions: &Extensions,
) -> Identity {
    if source == IdentitySource::UserOrIp {
        if let Some(user) = extensions.get::<AuthenticatedUser>() {
            return Identity::User(user.0.clone());
        }
    }
    Identity::Ip(client_ip(headers))
}
