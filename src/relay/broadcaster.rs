//! Snapshot Broadcaster
//!
//! Encodes a snapshot once and pushes the shared payload to every
//! connection of its session concurrently. A connection that cannot take
//! the frame within the write timeout is dropped from the registry; the
//! others are unaffected.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::registry::{Connection, ConnectionId, ConnectionRegistry};
use super::session::SessionKey;
use super::snapshot::{CodecError, JsonCodec, Payload, Snapshot, SnapshotCodec};

/// Configuration for the broadcaster
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How long a single connection may take to accept a frame
    pub write_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections that accepted the frame
    pub delivered: usize,
    /// Connections removed because delivery failed
    pub dropped: usize,
}

/// Per-connection delivery failure
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Write to connection {0} failed")]
    ConnectionWriteFailed(ConnectionId),

    #[error("Write to connection {0} timed out")]
    WriteTimedOut(ConnectionId),
}

/// Errors that abort a whole publish
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Snapshot for session {snapshot} published to session {target}")]
    SessionMismatch {
        snapshot: SessionKey,
        target: SessionKey,
    },
}

/// Fans snapshots out to the connections of a session
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    codec: Arc<dyn SnapshotCodec>,
    config: BroadcastConfig,
}

impl Broadcaster {
    /// Create a broadcaster using the JSON wire encoding
    pub fn new(registry: Arc<ConnectionRegistry>, config: BroadcastConfig) -> Self {
        Self::with_codec(registry, Arc::new(JsonCodec), config)
    }

    pub fn with_codec(
        registry: Arc<ConnectionRegistry>,
        codec: Arc<dyn SnapshotCodec>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            registry,
            codec,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Publish a snapshot to every connection registered for `session`
    ///
    /// The snapshot is encoded exactly once. Every connection registered at
    /// the time of the call either receives the payload or is removed from
    /// the registry.
    pub async fn publish(
        &self,
        session: &SessionKey,
        snapshot: &Snapshot,
    ) -> Result<PublishReport, PublishError> {
        if snapshot.session() != session {
            return Err(PublishError::SessionMismatch {
                snapshot: snapshot.session().clone(),
                target: session.clone(),
            });
        }

        let payload = self.codec.encode(snapshot)?;
        let connections = self.registry.connections_for(session);

        let deliveries = connections
            .iter()
            .map(|connection| self.deliver(connection, Arc::clone(&payload)));
        let results = join_all(deliveries).await;

        let mut report = PublishReport::default();
        for (connection, result) in connections.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        session = %session,
                        connection_id = %connection.id(),
                        error = %e,
                        "Dropping connection after failed delivery"
                    );
                    self.registry.unregister(&connection.handle());
                    report.dropped += 1;
                }
            }
        }

        tracing::trace!(
            session = %session,
            devices = snapshot.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Snapshot published"
        );
        Ok(report)
    }

    async fn deliver(&self, connection: &Connection, payload: Payload) -> Result<(), DeliveryError> {
        if connection.is_closed() {
            return Err(DeliveryError::ConnectionWriteFailed(connection.id().clone()));
        }

        match connection
            .sender()
            .send_timeout(payload, self.config.write_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(DeliveryError::WriteTimedOut(connection.id().clone()))
            }
            Err(SendTimeoutError::Closed(_)) => {
                Err(DeliveryError::ConnectionWriteFailed(connection.id().clone()))
            }
        }
    }
}
