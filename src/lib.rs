pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod observability;
pub mod rate_limit;
pub mod server;
pub mod store;

pub use server::{build_router, guard, AppState};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use tokio::net::TcpListener;
use tracing::info;

/// Run the standalone server until interrupted
pub async fn serve(config: AppConfig) -> Result<()> {
    // Validate configuration
    config.validate()?;

    info!("Starting clubguard");

    let state = AppState::build(&config).await?;
    let maintenance = server::spawn_maintenance(&state);
    let app = build_router(state, &config);

    // Bind and serve
    let listener = bind_listener(&config).await?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Internal(format!("Server error: {}", e)));

    maintenance.abort();
    info!("clubguard stopped");
    served
}

/// Bind the configured address; the listen address is only logged once bound
pub async fn bind_listener(config: &AppConfig) -> Result<TcpListener> {
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Server listening on {}", listener.local_addr()?);
    Ok(listener)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_listener_reports_bound_port() {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;

        let listener = bind_listener(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_listener_surfaces_errors() {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let taken = bind_listener(&config).await.unwrap();

        config.server.port = taken.local_addr().unwrap().port();
        assert!(matches!(bind_listener(&config).await, Err(AppError::Io(_))));
    }
}
