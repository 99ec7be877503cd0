//! Relay Server
//!
//! Ties connections to sessions and sessions to pollers. A session's poller
//! runs while the session has at least one connection.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use super::broadcaster::{BroadcastConfig, Broadcaster};
use super::poller::{Poller, PollerHandle, PollerReport, PollerState, SessionReaper};
use super::registry::{
    Connection, ConnectionHandle, ConnectionRegistry, RegistryConfig, RegistryError,
};
use super::session::SessionKey;
use super::snapshot::{Payload, SnapshotCodec};
use crate::upstream::DeviceSource;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tick period of every session poller
    pub poll_interval: Duration,
    /// Frames queued per connection before writes start timing out
    pub connection_buffer: usize,
    /// Session used when the connecting request names none
    pub default_session: SessionKey,
    pub registry: RegistryConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10_000),
            connection_buffer: 16,
            default_session: SessionKey::new("1"),
            registry: RegistryConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

/// A registered connection and the frames destined for it
pub struct Attachment {
    pub handle: ConnectionHandle,
    pub frames: mpsc::Receiver<Payload>,
}

/// Per-session status for operators
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: SessionKey,
    pub connections: usize,
    pub poller: PollerReport,
}

/// Running pollers keyed by session
///
/// The map lock also serializes attach, detach and reaping, so a session
/// never ends up with connections and no poller, or a poller and no
/// connections. It is always taken before the registry lock.
struct PollerSet {
    registry: Arc<ConnectionRegistry>,
    handles: Mutex<HashMap<SessionKey, PollerHandle>>,
}

impl PollerSet {
    /// Stop the session's poller if the session has no connections left
    fn stop_if_empty(&self, session: &SessionKey) -> bool {
        let stopped = {
            let mut handles = self.handles.lock();
            if self.registry.session_connection_count(session) > 0 {
                return false;
            }
            handles.remove(session)
        };
        stopped.is_some()
    }
}

impl SessionReaper for PollerSet {
    fn session_emptied(&self, session: &SessionKey) {
        if self.stop_if_empty(session) {
            tracing::info!(
                session = %session,
                "Last connection dropped by broadcaster, poller stopped"
            );
        }
    }
}

/// Owns the registry, the broadcaster and one poller per active session
pub struct RelayServer {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    source: Arc<dyn DeviceSource>,
    config: RelayConfig,
    pollers: Arc<PollerSet>,
}

impl RelayServer {
    pub fn new(source: Arc<dyn DeviceSource>, config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.registry.clone()));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            config.broadcast.clone(),
        ));
        Self::from_parts(source, registry, broadcaster, config)
    }

    /// Create a relay with a custom snapshot encoding
    pub fn with_codec(
        source: Arc<dyn DeviceSource>,
        codec: Arc<dyn SnapshotCodec>,
        config: RelayConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.registry.clone()));
        let broadcaster = Arc::new(Broadcaster::with_codec(
            Arc::clone(&registry),
            codec,
            config.broadcast.clone(),
        ));
        Self::from_parts(source, registry, broadcaster, config)
    }

    fn from_parts(
        source: Arc<dyn DeviceSource>,
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<Broadcaster>,
        config: RelayConfig,
    ) -> Self {
        let pollers = Arc::new(PollerSet {
            registry: Arc::clone(&registry),
            handles: Mutex::new(HashMap::new()),
        });
        Self {
            registry,
            broadcaster,
            source,
            config,
            pollers,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Resolve the session of a connecting client
    pub fn session_for(&self, requested: Option<&str>) -> SessionKey {
        match requested.map(str::trim) {
            Some(key) if !key.is_empty() => SessionKey::new(key),
            _ => self.config.default_session.clone(),
        }
    }

    /// Register a new connection and make sure its session is being polled
    ///
    /// Never waits on the upstream: the first snapshot arrives when the
    /// poller's first tick completes.
    pub fn attach(&self, session: SessionKey) -> Result<Attachment, RegistryError> {
        let (tx, frames) = mpsc::channel(self.config.connection_buffer);
        let connection = Connection::new(session.clone(), tx);

        let mut pollers = self.pollers.handles.lock();
        let handle = self.registry.register(connection)?;

        if !pollers.contains_key(&session) {
            let reaper: Weak<PollerSet> = Arc::downgrade(&self.pollers);
            let poller = Poller::new(
                session.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.broadcaster),
                self.config.poll_interval,
            )
            .with_reaper(reaper);
            pollers.insert(session.clone(), poller.spawn());
        }

        tracing::info!(
            session = %session,
            connection_id = %handle.id,
            connections = self.registry.connection_count(),
            "Client connected"
        );
        Ok(Attachment { handle, frames })
    }

    /// Unregister a connection, stopping the session's poller if it was the
    /// last one
    ///
    /// Safe to call for a connection the broadcaster already dropped.
    pub fn detach(&self, handle: &ConnectionHandle) {
        let stopped = {
            let mut pollers = self.pollers.handles.lock();
            self.registry.unregister(handle);

            if self.registry.session_connection_count(&handle.session) == 0 {
                pollers.remove(&handle.session)
            } else {
                None
            }
        };
        if let Some(poller) = stopped {
            poller.stop();
        }

        tracing::info!(
            session = %handle.session,
            connection_id = %handle.id,
            connections = self.registry.connection_count(),
            "Client disconnected"
        );
    }

    /// State of a session's poller (`Idle` when the session has no poller)
    pub fn poller_state(&self, session: &SessionKey) -> PollerState {
        self.pollers
            .handles
            .lock()
            .get(session)
            .map(PollerHandle::state)
            .unwrap_or(PollerState::Idle)
    }

    pub fn active_pollers(&self) -> usize {
        self.pollers.handles.lock().len()
    }

    /// Status of every session with a running poller
    pub fn session_reports(&self) -> Vec<SessionReport> {
        let pollers = self.pollers.handles.lock();
        let mut reports: Vec<SessionReport> = pollers
            .iter()
            .map(|(session, poller)| SessionReport {
                session: session.clone(),
                connections: self.registry.session_connection_count(session),
                poller: poller.stats().report(),
            })
            .collect();
        reports.sort_by(|a, b| a.session.cmp(&b.session));
        reports
    }

    /// Stop every poller
    pub fn shutdown(&self) {
        let stopped: Vec<_> = self.pollers.handles.lock().drain().collect();
        tracing::info!(pollers = stopped.len(), "Stopping all pollers");
        drop(stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::poller::tests::FakeSource;
    use crate::upstream::{DeviceRef, Reading};

    fn relay(source: Arc<FakeSource>, interval: Duration) -> RelayServer {
        RelayServer::new(
            source,
            RelayConfig {
                poll_interval: interval,
                ..Default::default()
            },
        )
    }

    fn source() -> Arc<FakeSource> {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(1), DeviceRef::new(2)]));
        source.set_reading(1, Some(Reading::new(Some(24.5), None, Some(55.0))));
        source
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.default_session, SessionKey::new("1"));
    }

    #[tokio::test]
    async fn test_session_for() {
        let relay = relay(source(), Duration::from_secs(10));
        assert_eq!(relay.session_for(None), SessionKey::new("1"));
        assert_eq!(relay.session_for(Some("  ")), SessionKey::new("1"));
        assert_eq!(relay.session_for(Some("42")), SessionKey::new("42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_lifecycle_follows_connections() {
        let relay = relay(source(), Duration::from_secs(10));
        let session = SessionKey::new("1");
        assert_eq!(relay.poller_state(&session), PollerState::Idle);

        let first = relay.attach(session.clone()).unwrap();
        let second = relay.attach(session.clone()).unwrap();
        assert_eq!(relay.active_pollers(), 1);
        assert_eq!(relay.poller_state(&session), PollerState::Running);

        relay.detach(&first.handle);
        assert_eq!(relay.poller_state(&session), PollerState::Running);

        relay.detach(&second.handle);
        assert_eq!(relay.active_pollers(), 0);
        assert_eq!(relay.registry().connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_poll_independently() {
        let relay = relay(source(), Duration::from_secs(10));

        let mut a = relay.attach(SessionKey::new("a")).unwrap();
        let mut b = relay.attach(SessionKey::new("b")).unwrap();
        assert_eq!(relay.active_pollers(), 2);

        assert!(a.frames.recv().await.is_some());
        assert!(b.frames.recv().await.is_some());

        relay.detach(&a.handle);
        assert_eq!(relay.active_pollers(), 1);
        assert_eq!(relay.session_reports()[0].session, SessionKey::new("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_halts_upstream_calls() {
        let source = source();
        let interval = Duration::from_secs(10);
        let relay = relay(Arc::clone(&source), interval);

        let mut attachment = relay.attach(SessionKey::new("1")).unwrap();
        attachment.frames.recv().await.unwrap();
        relay.detach(&attachment.handle);

        let calls = source.calls();
        tokio::time::sleep(interval * 2).await;
        assert_eq!(source.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gets_snapshot_within_one_interval() {
        let interval = Duration::from_secs(10);
        let relay = relay(source(), interval);
        let session = SessionKey::new("1");

        let mut attachment = relay.attach(session.clone()).unwrap();
        attachment.frames.recv().await.unwrap();
        relay.detach(&attachment.handle);

        tokio::time::sleep(Duration::from_secs(3)).await;

        let start = tokio::time::Instant::now();
        let mut attachment = relay.attach(session).unwrap();
        attachment.frames.recv().await.unwrap();
        assert!(start.elapsed() < interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_connection_dropped_survivor_served() {
        let relay = relay(source(), Duration::from_secs(10));
        let session = SessionKey::new("1");

        let c1 = relay.attach(session.clone()).unwrap();
        let mut c2 = relay.attach(session.clone()).unwrap();
        let dead = c1.handle.clone();
        drop(c1.frames);

        let payload = c2.frames.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value[0]["id"], 1);
        assert_eq!(value[1]["reading"], serde_json::Value::Null);

        assert!(!relay.registry().contains(&dead));
        assert_eq!(relay.registry().connections_for(&session).len(), 1);

        // The writer task of the dead connection still detaches afterwards
        relay.detach(&dead);
        assert_eq!(relay.poller_state(&session), PollerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_last_connection_stops_poller() {
        let source = source();
        let interval = Duration::from_secs(1);
        let relay = RelayServer::new(
            Arc::clone(&source) as Arc<dyn DeviceSource>,
            RelayConfig {
                poll_interval: interval,
                connection_buffer: 1,
                broadcast: BroadcastConfig {
                    write_timeout: Duration::from_millis(50),
                },
                ..Default::default()
            },
        );
        let session = SessionKey::new("1");

        // Never drained: the first snapshot fills the queue, the second times out
        let stalled = relay.attach(session.clone()).unwrap();
        tokio::time::sleep(interval * 3).await;

        assert!(!relay.registry().contains(&stalled.handle));
        assert_eq!(relay.active_pollers(), 0);
        assert_eq!(relay.poller_state(&session), PollerState::Idle);

        let calls = source.calls();
        tokio::time::sleep(interval * 5).await;
        assert_eq!(source.calls(), calls);

        // The writer detaching afterwards changes nothing
        relay.detach(&stalled.handle);
        assert_eq!(relay.active_pollers(), 0);

        // A new client starts a fresh poller
        let mut fresh = relay.attach(session.clone()).unwrap();
        assert!(fresh.frames.recv().await.is_some());
        assert_eq!(relay.poller_state(&session), PollerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_leaves_survivor_polled() {
        let relay = RelayServer::new(
            source(),
            RelayConfig {
                poll_interval: Duration::from_secs(1),
                connection_buffer: 1,
                broadcast: BroadcastConfig {
                    write_timeout: Duration::from_millis(50),
                },
                ..Default::default()
            },
        );
        let session = SessionKey::new("1");

        let stalled = relay.attach(session.clone()).unwrap();
        let mut reader = relay.attach(session.clone()).unwrap();

        for _ in 0..3 {
            assert!(reader.frames.recv().await.is_some());
        }

        assert!(!relay.registry().contains(&stalled.handle));
        assert_eq!(relay.poller_state(&session), PollerState::Running);
    }

    #[tokio::test]
    async fn test_attach_respects_connection_limit() {
        let relay = RelayServer::new(
            source(),
            RelayConfig {
                registry: RegistryConfig { max_connections: 1 },
                ..Default::default()
            },
        );

        let _first = relay.attach(SessionKey::new("1")).unwrap();
        let second = relay.attach(SessionKey::new("2"));
        assert!(matches!(second, Err(RegistryError::TooManyConnections(1))));
        assert_eq!(relay.active_pollers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_pollers() {
        let relay = relay(source(), Duration::from_secs(10));
        let _a = relay.attach(SessionKey::new("a")).unwrap();
        let _b = relay.attach(SessionKey::new("b")).unwrap();

        relay.shutdown();
        assert_eq!(relay.active_pollers(), 0);
    }
}
