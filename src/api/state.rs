//! Application State
//!
//! Shared state accessible by all handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::relay::{RelayConfig, RelayServer};
use crate::upstream::DeviceSource;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Relay owning connections, pollers and the broadcaster
    pub relay: Arc<RelayServer>,
    /// Server configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create the state around an existing relay
    pub fn new(relay: Arc<RelayServer>, config: ApiConfig) -> Self {
        Self {
            relay,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Create the state and a relay polling `source`
    pub fn with_source(
        source: Arc<dyn DeviceSource>,
        relay_config: RelayConfig,
        config: ApiConfig,
    ) -> Self {
        Self::new(Arc::new(RelayServer::new(source, relay_config)), config)
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get WebSocket connection count
    pub fn ws_connection_count(&self) -> usize {
        self.relay.registry().connection_count()
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8082,
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_addr() {
        assert_eq!(ApiConfig::default().addr(), "0.0.0.0:8082");
        assert_eq!(ApiConfig::new("127.0.0.1", 9000).addr(), "127.0.0.1:9000");
    }
}
