//! Relay HTTP Surface
//!
//! WebSocket endpoint plus operator endpoints, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /` - Real-time snapshot stream (path used by existing clients)
//! - `GET /ws` - Same stream
//!
//! ## Sessions
//! - `GET /api/v1/sessions` - Active sessions and poller statistics
//! - `GET /api/v1/sessions/:key` - One session
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use terrarium_relay::api::{serve, ApiConfig, AppState};
//! use terrarium_relay::relay::RelayConfig;
//! use terrarium_relay::upstream::{UpstreamClient, UpstreamConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(UpstreamClient::new(UpstreamConfig::default()));
//!     let config = ApiConfig::default();
//!
//!     let state = AppState::with_source(source, RelayConfig::default(), config.clone());
//!     serve(state, &config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::relay::websocket_handler;

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/sessions", get(routes::sessions::list_sessions))
        .route("/sessions/:key", get(routes::sessions::get_session));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let shared_state = Arc::new(state);

    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Bind the listening socket
///
/// This is the only failure of the relay that should end the process.
pub async fn bind(config: &ApiConfig) -> Result<TcpListener, ApiError> {
    let addr = config.addr();
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ApiError::Bind { addr, source })
}

/// Start the server and run until Ctrl+C / SIGTERM
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let listener = bind(config).await?;
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves
///
/// All pollers are stopped once the server has shut down.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let relay = Arc::clone(&state.relay);
    let router = build_router(state);

    tracing::info!("Terrarium relay listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    relay.shutdown();
    tracing::info!("Terrarium relay shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
