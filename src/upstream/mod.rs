//! Upstream Terrarium API
//!
//! Read-only access to the external device directory and current-reading
//! endpoints.
//!
//! - `GET /users/{userId}` - device list of a user (`terrariumData`)
//! - `GET /readings/current/reading/{deviceId}` - latest reading of a device

mod client;
mod error;
mod types;

pub use client::{UpstreamClient, UpstreamConfig};
pub use error::{UpstreamError, UpstreamResult};
pub use types::{DeviceId, DeviceReading, DeviceRef, Reading};

use async_trait::async_trait;

use crate::relay::SessionKey;

/// Source of device lists and readings for the pollers
///
/// [`UpstreamClient`] is the production implementation; tests drive
/// pollers with in-memory sources.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Devices belonging to the session's user, in directory order
    async fn fetch_devices(&self, key: &SessionKey) -> UpstreamResult<Vec<DeviceRef>>;

    /// Current reading of one device
    async fn fetch_reading(&self, id: &DeviceId) -> UpstreamResult<DeviceReading>;
}
