//! # Terrarium Relay
//!
//! Real-time telemetry relay for terrarium sensors: polls an upstream REST
//! API on behalf of connected WebSocket clients and pushes every client of a
//! session the same snapshot of its terrariums' latest readings.
//!
//! ## Features
//!
//! - **Session scoped**: one poll loop per active user, started by the first
//!   client and stopped when the last one leaves
//! - **Encode once**: each snapshot is serialized a single time and shared by
//!   all recipients
//! - **Isolated delivery**: a slow or dead client is dropped without delaying
//!   the others
//! - **Failure tolerant**: upstream outages skip a tick, never end the loop
//!
//! ## Modules
//!
//! - [`upstream`]: client for the device directory and reading endpoints
//! - [`relay`]: registry, broadcaster, pollers and the WebSocket handler
//! - [`api`]: HTTP server with Axum
//! - [`config`]: TOML / environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use terrarium_relay::api::{serve, ApiConfig, AppState};
//! use terrarium_relay::relay::RelayConfig;
//! use terrarium_relay::upstream::{UpstreamClient, UpstreamConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(UpstreamClient::new(UpstreamConfig {
//!         base_url: "http://localhost:8080".to_string(),
//!         request_timeout_ms: 5000,
//!     }));
//!
//!     let api_config = ApiConfig::new("0.0.0.0", 8082);
//!     let state = AppState::with_source(source, RelayConfig::default(), api_config.clone());
//!
//!     serve(state, &api_config).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod relay;
pub mod upstream;

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use relay::{
    Broadcaster, ConnectionRegistry, JsonCodec, Poller, PollerHandle, PollerState, PublishReport,
    RelayConfig, RelayServer, SessionKey, Snapshot, SnapshotCodec, SnapshotEntry,
};

pub use upstream::{
    DeviceId, DeviceReading, DeviceRef, DeviceSource, Reading, UpstreamClient, UpstreamConfig,
    UpstreamError,
};

pub use config::{Config, ConfigError, LoggingConfig};
