//! Session Routes
//!
//! Operator view of the active sessions and their pollers.
//!
//! - GET /api/v1/sessions - All sessions with a running poller
//! - GET /api/v1/sessions/:key - One session

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::SessionsResponse;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::relay::SessionReport;

/// GET /api/v1/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionsResponse> {
    let sessions = state.relay.session_reports();
    let total = sessions.len();
    Json(SessionsResponse { sessions, total })
}

/// GET /api/v1/sessions/:key
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<SessionReport>> {
    state
        .relay
        .session_reports()
        .into_iter()
        .find(|r| r.session.as_str() == key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No active session '{}'", key)))
}
