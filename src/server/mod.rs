//! HTTP surface: shared state, the route guard and the service's own routes.

pub mod admin;

use crate::cache::{cache_middleware, CacheMiddleware, CacheTier, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::Result;
use crate::metrics::{metrics_handler, metrics_middleware, MetricsService};
use crate::observability::request_id_middleware;
use crate::rate_limit::{rate_limit_middleware, PolicyName, RateLimitMiddleware, RateLimiterService};
use crate::store::{self, CacheStore};
use axum::{
    extract::State,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// How often local maps are swept for expired entries
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Components shared by every request
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiterService>,
    pub cache: Arc<ResponseCache>,
    pub store: Option<Arc<dyn CacheStore>>,
    pub metrics: Option<MetricsService>,
}

impl AppState {
    /// Connect the configured store and build every component
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = store::connect(&config.store, clock.clone()).await;

        let mut state = Self::with_store(config, store, clock)?;
        if config.server.metrics {
            state.metrics = match MetricsService::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    warn!(error = %e, "Metrics disabled");
                    None
                }
            };
        }
        Ok(state)
    }

    /// Build every component on an explicit store and clock, without metrics
    pub fn with_store(
        config: &AppConfig,
        store: Option<Arc<dyn CacheStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policies = config.rate_limiting.policy_table()?;
        let limiter = RateLimiterService::new(store.clone(), policies, clock.clone())
            .with_enabled(config.rate_limiting.enabled);
        let cache = ResponseCache::new(store.clone(), clock).with_config(&config.cache);

        Ok(Self {
            limiter: Arc::new(limiter),
            cache: Arc::new(cache),
            store,
            metrics: None,
        })
    }
}

/// Put a group of routes behind a rate limit policy and, optionally, a
/// cache tier. The rate limit runs first, so cache hits still count
/// against the caller's quota.
pub fn guard<S>(
    router: Router<S>,
    state: &AppState,
    policy: PolicyName,
    tier: Option<CacheTier>,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let router = match tier {
        Some(tier) => router.layer(from_fn_with_state(
            CacheMiddleware::new(state.cache.clone(), tier),
            cache_middleware,
        )),
        None => router,
    };

    router.layer(from_fn_with_state(
        RateLimitMiddleware::new(state.limiter.clone(), policy),
        rate_limit_middleware,
    ))
}

/// Liveness plus store reachability
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (backend, reachable) = match &state.store {
        Some(store) => (store.backend(), store.ping().await.is_ok()),
        None => ("none", false),
    };

    let body = Json(json!({
        "status": "ok",
        "store": {
            "backend": backend,
            "reachable": reachable,
        },
        "rate_limiting": {
            "enabled": state.limiter.is_enabled(),
            "distributed": state.limiter.is_distributed(),
        },
        "cache": {
            "enabled": state.cache.is_enabled(),
        },
    }));

    (StatusCode::OK, body)
}

/// Routes served by the standalone binary
pub fn build_router(state: AppState, config: &AppConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(state.metrics.clone()),
        );

    if config.server.expose_admin {
        info!("Admin routes mounted under /internal");
        router = router.merge(admin::router(&state));
    }

    router
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
}

/// Periodically sweep the local fallback and in-memory store
pub fn spawn_maintenance(state: &AppState) -> tokio::task::JoinHandle<()> {
    let limiter = state.limiter.clone();
    let store = state.store.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            let windows = limiter.purge_local();
            let entries = store.as_ref().map_or(0, |store| store.evict_expired());
            if windows + entries > 0 {
                debug!(windows, entries, "Purged expired local entries");
            }
        }
    })
}
