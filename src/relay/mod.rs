//! Real-Time Telemetry Relay
//!
//! Polls the upstream terrarium API per session and pushes snapshots to
//! every WebSocket client of that session.
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: live connections grouped by session
//! - **Broadcaster**: encodes a snapshot once, fans it out concurrently
//! - **Poller**: one timer-driven loop per active session
//! - **RelayServer**: attaches/detaches connections, starts/stops pollers
//! - **Handler**: WebSocket upgrade and connection lifecycle
//!
//! ## Usage
//!
//! Clients connect to `/` or `/ws`, optionally naming the user whose
//! terrariums they want (`/ws?user=1`). No message is expected from the
//! client; the server pushes one JSON array per poll tick.
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8082/ws?user=1');
//!
//! ws.onmessage = (event) => {
//!   const terrariums = JSON.parse(event.data);
//!   console.log('Received:', terrariums);
//! };
//! ```

mod broadcaster;
mod handler;
mod poller;
mod registry;
mod server;
mod session;
mod snapshot;

pub use broadcaster::{BroadcastConfig, Broadcaster, DeliveryError, PublishError, PublishReport};
pub use handler::{websocket_handler, ConnectParams};
pub use poller::{
    Poller, PollerHandle, PollerReport, PollerState, PollerStats, SessionReaper, TickOutcome,
};
pub use registry::{
    Connection, ConnectionHandle, ConnectionId, ConnectionRegistry, RegistryConfig,
    RegistryError,
};
pub use server::{Attachment, RelayConfig, RelayServer, SessionReport};
pub use session::SessionKey;
pub use snapshot::{CodecError, JsonCodec, Payload, Snapshot, SnapshotCodec, SnapshotEntry};

#[cfg(test)]
pub(crate) use poller::tests::FakeSource;
