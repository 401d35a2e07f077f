use super::keys::{build_key, CacheTier};
use super::{CachedResponse, ResponseCache};
use crate::error::AppError;
use crate::identity::AuthenticatedUser;
use crate::metrics;
use axum::{
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_AGE: &str = "x-cache-age";

/// Response cache middleware state: one tier applied to a group of routes
#[derive(Clone)]
pub struct CacheMiddleware {
    cache: Arc<ResponseCache>,
    tier: CacheTier,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<ResponseCache>, tier: CacheTier) -> Self {
        Self { cache, tier }
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    /// Store key for a request, `None` when it must not be cached
    pub fn key_for(&self, request: &Request) -> Option<String> {
        if request.method() != Method::GET || !self.cache.is_enabled() {
            return None;
        }

        let user_id = request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.as_str());

        build_key(
            self.tier,
            request.method().as_str(),
            request.uri().path(),
            request.uri().query(),
            user_id,
        )
    }
}

/// Axum middleware function serving and filling the response cache
pub async fn cache_middleware(
    State(layer): State<CacheMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = layer.key_for(&request) else {
        return next.run(request).await;
    };
    let if_none_match = request
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let cache = &layer.cache;
    let tier = layer.tier;
    let ttl = cache.ttl(tier);

    if let Some(cached) = cache.get::<CachedResponse>(&key).await {
        if etag_matches(if_none_match.as_deref(), &cached.etag) {
            debug!(key = %key, "Cache HIT (304 Not Modified)");
            metrics::record_cache_lookup(tier.as_str(), "not_modified");
            return not_modified(&cached, tier, ttl);
        }

        debug!(key = %key, "Cache HIT");
        metrics::record_cache_lookup(tier.as_str(), "hit");
        return replay(&cached, tier, ttl, cache.now_ms());
    }

    debug!(key = %key, "Cache MISS");
    metrics::record_cache_lookup(tier.as_str(), "miss");

    let response = next.run(request).await;
    if response.status().as_u16() >= 400 {
        return response;
    }

    let max_body_bytes = cache.max_body_bytes();
    let fits = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|len| len as usize <= max_body_bytes);
    if !fits {
        debug!(key = %key, "Response body too large or unbounded, not cached");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes: Bytes = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to buffer response body");
            return AppError::Internal("Failed to read response body".to_string())
                .into_response();
        }
    };

    let body = match std::str::from_utf8(&bytes) {
        Ok(text) if !text.is_empty() => text.to_string(),
        _ => return Response::from_parts(parts, Body::from(bytes)),
    };

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let cached = CachedResponse::new(parts.status.as_u16(), content_type, body, cache.now_ms());

    cache.set(&key, &cached, ttl).await;
    write_cache_headers(&mut parts.headers, &cached.etag, tier, ttl, "MISS");

    Response::from_parts(parts, Body::from(bytes))
}

/// `If-None-Match` matches the entry, weak form accepted
fn etag_matches(if_none_match: Option<&str>, etag: &str) -> bool {
    let Some(candidates) = if_none_match else {
        return false;
    };

    candidates
        .split(',')
        .map(str::trim)
        .any(|candidate| {
            candidate == "*" || candidate == etag || candidate.strip_prefix("W/") == Some(etag)
        })
}

fn write_cache_headers(
    headers: &mut HeaderMap,
    etag: &str,
    tier: CacheTier,
    ttl: Duration,
    result: &'static str,
) {
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&tier.cache_control(ttl)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(X_CACHE, HeaderValue::from_static(result));
}

fn not_modified(cached: &CachedResponse, tier: CacheTier, ttl: Duration) -> Response {
    let mut headers = HeaderMap::new();
    write_cache_headers(&mut headers, &cached.etag, tier, ttl, "HIT-304");
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

fn replay(cached: &CachedResponse, tier: CacheTier, ttl: Duration, now_ms: i64) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    if let Some(value) = cached
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    write_cache_headers(&mut headers, &cached.etag, tier, ttl, "HIT");
    headers.insert(X_CACHE_AGE, HeaderValue::from(cached.age_secs(now_ms)));

    (status, headers, cached.body.clone()).into_response()
}
