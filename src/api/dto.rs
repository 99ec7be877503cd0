//! Data Transfer Objects
//!
//! Response types for the operator endpoints.

use serde::Serialize;

use crate::relay::SessionReport;

/// Full health status response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy" or "degraded"
    pub status: String,
    /// Open WebSocket connections
    pub connections: usize,
    /// Sessions with a running poller
    pub active_sessions: usize,
    /// Sessions whose last tick was skipped
    pub stale_sessions: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Server version
    pub version: String,
}

/// Active sessions response
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionReport>,
    pub total: usize,
}
