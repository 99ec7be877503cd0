//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (ready to serve traffic)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// The relay accepts connections as soon as it is listening; the upstream
/// is not consulted, since a down upstream only makes sessions stale.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /health
///
/// Full health status. "degraded" when any session's last tick failed to
/// fetch its device list.
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let reports = state.relay.session_reports();
    let stale_sessions = reports
        .iter()
        .filter(|r| r.poller.consecutive_skips > 0)
        .count();

    let status = if stale_sessions == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        connections: state.ws_connection_count(),
        active_sessions: reports.len(),
        stale_sessions,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let status = liveness().await;
        assert_eq!(status, StatusCode::OK);
    }
}
