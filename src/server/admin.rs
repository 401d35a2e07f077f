//! Operator routes under `/internal`, themselves behind the admin policy.

use super::{guard, AppState};
use crate::cache::{is_cache_keyspace, CacheAction, InvalidationContext};
use crate::error::{AppError, Result, StoreError};
use crate::rate_limit::PolicyName;
use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

/// Body of `POST /internal/cache/invalidate`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(flatten)]
    pub context: InvalidationContext,
}

pub fn router(state: &AppState) -> Router {
    let routes = Router::new()
        .route(
            "/internal/rate-limit/:policy/:identity",
            get(rate_limit_status).delete(rate_limit_reset),
        )
        .route("/internal/cache/stats", get(cache_stats))
        .route("/internal/cache", delete(cache_clear))
        .route("/internal/cache/invalidate", post(cache_invalidate))
        .with_state(state.clone());

    guard(routes, state, PolicyName::Admin, None)
}

async fn rate_limit_status(
    State(state): State<AppState>,
    Path((policy, identity)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let policy = state.limiter.policy(policy.parse::<PolicyName>()?).clone();
    let status = state.limiter.status(&identity, &policy).await;

    Ok(Json(json!({
        "success": true,
        "policy": policy.name,
        "limit": policy.max_requests,
        "window_ms": policy.window_ms,
        "status": status,
    })))
}

async fn rate_limit_reset(
    State(state): State<AppState>,
    Path((policy, identity)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let policy = state.limiter.policy(policy.parse::<PolicyName>()?).clone();
    let reset = state.limiter.reset(&identity, &policy).await;
    info!(policy = %policy.name, identity = %identity, reset, "Rate limit reset requested");

    Ok(Json(json!({ "success": true, "reset": reset })))
}

async fn cache_stats(State(state): State<AppState>) -> Result<Json<Value>> {
    let stats = state.cache.stats().await.ok_or_else(|| {
        AppError::Store(StoreError::Unavailable(
            "cache store unavailable".to_string(),
        ))
    })?;

    Ok(Json(json!({ "success": true, "stats": stats })))
}

async fn cache_clear(State(state): State<AppState>) -> Json<Value> {
    let removed = state.cache.clear_all().await;
    Json(json!({ "success": true, "removed": removed }))
}

async fn cache_invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<Value>> {
    let removed = match (&request.prefix, &request.action) {
        (Some(prefix), None) if is_cache_keyspace(prefix) => {
            state.cache.invalidate_by_prefix(prefix).await
        }
        (Some(prefix), None) => {
            return Err(AppError::BadRequest(format!(
                "prefix must start with a cache tier such as \"user:\", got {:?}",
                prefix
            )))
        }
        (None, Some(action)) => {
            let action = action.parse::<CacheAction>()?;
            state
                .cache
                .invalidate_action(action, &request.context)
                .await
        }
        _ => {
            return Err(AppError::BadRequest(
                "expected exactly one of a prefix or an action".to_string(),
            ))
        }
    };

    Ok(Json(json!({ "success": true, "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::store::{CacheStore, MemoryStore};
    use axum::{body::Body, extract::Request, http::StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(clock.clone()));
        AppState::with_store(&AppConfig::default(), Some(store), clock).unwrap()
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 8192).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let state = state();
        let policy = state.limiter.policy(PolicyName::Payment).clone();
        for _ in 0..3 {
            state.limiter.check_and_consume("user:5", &policy).await;
        }

        let app = router(&state);
        let (status, body) = call(app.clone(), "GET", "/internal/rate-limit/payment/user:5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["count"], 3);
        assert_eq!(body["limit"], 10);

        let (_, body) = call(app.clone(), "DELETE", "/internal/rate-limit/payment/user:5", None).await;
        assert_eq!(body["reset"], true);

        let (_, body) = call(app.clone(), "GET", "/internal/rate-limit/payment/user:5", None).await;
        assert!(body["status"].is_null());

        let (status, _) = call(app, "GET", "/internal/rate-limit/premium/user:5", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cache_maintenance_routes() {
        let state = state();
        let ttl = Duration::from_secs(60);
        state.cache.set("hot:GET:/api/v1/ratings", &1, ttl).await;
        state.cache.set("user:1:GET:/api/v1/me", &1, ttl).await;
        state.cache.set("user:2:GET:/api/v1/me", &1, ttl).await;

        let app = router(&state);
        let (_, body) = call(app.clone(), "GET", "/internal/cache/stats", None).await;
        assert_eq!(body["stats"]["total_keys"], 3);

        let (_, body) = call(
            app.clone(),
            "POST",
            "/internal/cache/invalidate",
            Some(json!({"action": "user.update", "userId": "1"})),
        )
        .await;
        assert_eq!(body["removed"], 1);

        let (_, body) = call(
            app.clone(),
            "POST",
            "/internal/cache/invalidate",
            Some(json!({"prefix": "hot:"})),
        )
        .await;
        assert_eq!(body["removed"], 1);

        let (status, _) = call(
            app.clone(),
            "POST",
            "/internal/cache/invalidate",
            Some(json!({"action": "user.delete"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(app, "DELETE", "/internal/cache", None).await;
        assert_eq!(body["removed"], 1);
    }

    #[tokio::test]
    async fn test_invalidate_rejects_prefix_outside_cache() {
        let state = state();
        let login = state.limiter.policy(PolicyName::Login).clone();
        for _ in 0..=login.max_requests {
            state.limiter.check_and_consume("ip:10.1.1.1", &login).await;
        }

        let app = router(&state);
        for prefix in ["", "r", "rl:", "ratelimit:auth:"] {
            let (status, body) = call(
                app.clone(),
                "POST",
                "/internal/cache/invalidate",
                Some(json!({ "prefix": prefix })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "prefix {:?}", prefix);
            assert_eq!(body["success"], false);
        }

        assert!(!state.limiter.check_and_consume("ip:10.1.1.1", &login).await.allowed);
    }

    #[tokio::test]
    async fn test_stats_unavailable_without_store() {
        let state =
            AppState::with_store(&AppConfig::default(), None, Arc::new(ManualClock::new(0)))
                .unwrap();
        let (status, body) = call(router(&state), "GET", "/internal/cache/stats", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
    }
}
