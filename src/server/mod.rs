pub mod middleware;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{RateLimitError, Result};
use crate::limiter::engine::RateLimiter;
use crate::limiter::resolver::PolicyRegistry;
use crate::metrics;
use crate::storage::Storage;
use middleware::RateLimitLayer;

/// HTTP server configuration
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build the application router with the rate limiter applied globally.
///
/// `/metrics` is added after the layer so scrapes are never rate
/// limited.
pub fn build_router<S: Storage + 'static>(
    limiter: Arc<RateLimiter<S>>,
    registry: Arc<PolicyRegistry>,
) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .layer(RateLimitLayer::new(limiter, registry))
        .route("/metrics", get(metrics_handler))
}

/// Start the HTTP server and serve until a shutdown signal arrives
pub async fn start_server<S: Storage + 'static>(
    config: ServerConfig,
    limiter: Arc<RateLimiter<S>>,
    registry: Arc<PolicyRegistry>,
) -> Result<()> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        RateLimitError::InternalError(format!("Failed to bind {}: {}", addr, e))
    })?;

    info!("HTTP server listening on {}", addr);

    let app = build_router(limiter, registry);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| RateLimitError::InternalError(format!("Server error: {}", e)))?;

    info!("Server stopped");
    Ok(())
}

async fn root() -> &'static str {
    "Rate Limiter is running"
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_handler() -> (StatusCode, String) {
    match metrics::encode_text() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections...");
}
