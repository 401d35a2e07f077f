use super::service::RateLimiterService;
use super::types::{Decision, PolicyName, RateLimitPolicy};
use crate::identity::resolve_identity;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Rate limiting middleware state: one policy applied to a group of routes
#[derive(Clone)]
pub struct RateLimitMiddleware {
    service: Arc<RateLimiterService>,
    policy: Arc<RateLimitPolicy>,
}

impl RateLimitMiddleware {
    pub fn new(service: Arc<RateLimiterService>, policy: PolicyName) -> Self {
        let policy = Arc::new(service.policy(policy).clone());
        Self { service, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Identity the request counts against, `None` when the policy does
    /// not apply to it
    pub fn identify(&self, request: &Request) -> Option<String> {
        if !self.service.is_enabled() || self.policy.skips(request.uri().path()) {
            return None;
        }
        Some(
            resolve_identity(self.policy.identity, request.headers(), request.extensions())
                .to_string(),
        )
    }

    /// Decide on a request, returning the 429 response on rejection
    pub async fn apply(&self, identity: &str) -> Result<Decision, Response> {
        let decision = self.service.check_and_consume(identity, &self.policy).await;

        if !decision.allowed {
            warn!(
                identifier = %identity,
                policy = %self.policy.name,
                limit = decision.limit,
                reset = decision.reset_at_ms,
                "Rate limit exceeded"
            );
            return Err(create_rate_limit_response(
                &decision,
                self.service.now_ms(),
            ));
        }

        debug!(
            identifier = %identity,
            policy = %self.policy.name,
            remaining = decision.remaining,
            "Rate limit check passed"
        );
        Ok(decision)
    }
}

/// Axum middleware function for rate limiting
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let Some(identity) = limiter.identify(&request) else {
        return next.run(request).await;
    };

    match limiter.apply(&identity).await {
        Ok(decision) => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Err(response) => response,
    }
}

/// Write the `X-RateLimit-*` headers for a decision
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_at_ms));
}

/// Create a 429 Too Many Requests response with rate limit headers
fn create_rate_limit_response(decision: &Decision, now_ms: i64) -> Response {
    let retry_after = decision.retry_after_secs(now_ms);

    let mut headers = HeaderMap::new();
    add_rate_limit_headers(&mut headers, decision);
    headers.insert(RETRY_AFTER_HEADER, HeaderValue::from(retry_after));

    let body = Json(serde_json::json!({
        "success": false,
        "error": "Too Many Requests",
        "message": format!(
            "Rate limit exceeded. Please try again in {} seconds.",
            retry_after
        ),
        "retryAfter": retry_after,
    }));

    (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::AuthenticatedUser;
    use crate::rate_limit::types::PolicyTable;
    use axum::body::Body;

    fn middleware(policy: PolicyName) -> RateLimitMiddleware {
        let clock = Arc::new(ManualClock::new(0));
        let service = RateLimiterService::local_only(PolicyTable::default(), clock);
        RateLimitMiddleware::new(Arc::new(service), policy)
    }

    fn request_from(ip: &str) -> Request {
        Request::builder()
            .uri("/api/v1/payments/create")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_rate_limit_response() {
        let decision = Decision::new(false, 100, 101, 30_000);
        let response = create_rate_limit_response(&decision, 0);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "30000");
        assert_eq!(headers.get("Retry-After").unwrap(), "30");
    }

    #[tokio::test]
    async fn test_apply_keys_by_user_when_authenticated() {
        let limiter = middleware(PolicyName::Payment);

        for _ in 0..10 {
            let mut request = request_from("1.1.1.1");
            request
                .extensions_mut()
                .insert(AuthenticatedUser("42".to_string()));
            let identity = limiter.identify(&request).unwrap();
            assert_eq!(identity, "user:42");
            assert!(limiter.apply(&identity).await.is_ok());
        }
        assert!(limiter.apply("user:42").await.is_err());

        // Same address, anonymous: separate counter
        let identity = limiter.identify(&request_from("1.1.1.1")).unwrap();
        assert_eq!(identity, "ip:1.1.1.1");
        assert!(limiter.apply(&identity).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_login_keys_by_ip_only() {
        let limiter = middleware(PolicyName::Login);

        for user in 0..5 {
            let mut request = request_from("9.9.9.9");
            request
                .extensions_mut()
                .insert(AuthenticatedUser(user.to_string()));
            let identity = limiter.identify(&request).unwrap();
            assert_eq!(identity, "ip:9.9.9.9");
            assert!(limiter.apply(&identity).await.is_ok());
        }
        assert!(limiter.apply("ip:9.9.9.9").await.is_err());
    }
}
