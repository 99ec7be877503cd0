//! Connection Registry
//!
//! Tracks live real-time connections grouped by session. All mutation goes
//! through [`ConnectionRegistry::register`] and
//! [`ConnectionRegistry::unregister`]; readers get point-in-time copies so
//! a broadcast never holds the lock while writing to sockets.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::session::SessionKey;
use super::snapshot::Payload;

/// Unique identifier for a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sending side of one client connection
///
/// Frames pushed here are drained by the connection's socket writer task.
/// Clones share the closed flag, so once the registry drops a connection no
/// clone still held by an in-flight publish will write to it.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    session: SessionKey,
    sender: mpsc::Sender<Payload>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(session: SessionKey, sender: mpsc::Sender<Payload>) -> Self {
        Self {
            id: ConnectionId::generate(),
            session,
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn sender(&self) -> &mpsc::Sender<Payload> {
        &self.sender
    }

    /// Whether the connection was unregistered or its writer has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id.clone(),
            session: self.session.clone(),
        }
    }
}

/// Receipt for a registered connection, used to unregister it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub session: SessionKey,
}

/// Configuration for the connection registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrent connections across all sessions
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Per-session set of live connections
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<SessionKey, HashMap<ConnectionId, Connection>>>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a connection under its session
    ///
    /// Fails if the connection limit is reached or the same connection is
    /// registered twice.
    pub fn register(&self, connection: Connection) -> Result<ConnectionHandle, RegistryError> {
        let mut sessions = self.sessions.write();

        let total: usize = sessions.values().map(HashMap::len).sum();
        if total >= self.config.max_connections {
            return Err(RegistryError::TooManyConnections(self.config.max_connections));
        }

        let handle = connection.handle();
        let connections = sessions.entry(handle.session.clone()).or_default();
        if connections.contains_key(&handle.id) {
            return Err(RegistryError::AlreadyRegistered(handle.id.to_string()));
        }
        connections.insert(handle.id.clone(), connection);

        tracing::debug!(
            session = %handle.session,
            connection_id = %handle.id,
            session_connections = connections.len(),
            "Connection registered"
        );
        Ok(handle)
    }

    /// Remove a connection and mark it closed
    ///
    /// Returns the number of connections left in the session, or `None` if
    /// the handle was not registered (already removed, e.g. by a failed
    /// broadcast).
    pub fn unregister(&self, handle: &ConnectionHandle) -> Option<usize> {
        let mut sessions = self.sessions.write();

        let connections = sessions.get_mut(&handle.session)?;
        let connection = connections.remove(&handle.id)?;
        connection.mark_closed();

        let remaining = connections.len();
        if remaining == 0 {
            sessions.remove(&handle.session);
        }

        tracing::debug!(
            session = %handle.session,
            connection_id = %handle.id,
            remaining,
            "Connection unregistered"
        );
        Some(remaining)
    }

    /// Connections of a session at this moment
    pub fn connections_for(&self, session: &SessionKey) -> Vec<Connection> {
        self.sessions
            .read()
            .get(session)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, handle: &ConnectionHandle) -> bool {
        self.sessions
            .read()
            .get(&handle.session)
            .map(|c| c.contains_key(&handle.id))
            .unwrap_or(false)
    }

    /// Total connection count across sessions
    pub fn connection_count(&self) -> usize {
        self.sessions.read().values().map(HashMap::len).sum()
    }

    /// Number of sessions with at least one connection
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_connection_count(&self, session: &SessionKey) -> usize {
        self.sessions
            .read()
            .get(session)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Sessions that currently have connections
    pub fn sessions(&self) -> Vec<SessionKey> {
        self.sessions.read().keys().cloned().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Errors that can occur in the connection registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Connection already registered: {0}")]
    AlreadyRegistered(String),
}
