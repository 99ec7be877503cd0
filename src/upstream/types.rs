//! Upstream Data Types
//!
//! Device references and current readings as returned by the terrarium
//! REST API. Fields the relay does not interpret are kept verbatim so they
//! reach WebSocket clients unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of a terrarium device
///
/// The upstream uses numeric ids today, but the relay never does arithmetic
/// on them, so textual ids are accepted as well and serialized back in the
/// shape they arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Number(i64),
    Text(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Number(n) => write!(f, "{}", n),
            DeviceId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for DeviceId {
    fn from(id: i64) -> Self {
        DeviceId::Number(id)
    }
}

impl From<i32> for DeviceId {
    fn from(id: i32) -> Self {
        DeviceId::Number(id.into())
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        DeviceId::Text(id.to_string())
    }
}

/// A device entry from the user directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Everything else the UI displays (type, settings, pins, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceRef {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            extra: Map::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether the device's own wire fields already use `key`
    pub fn has_field(&self, key: &str) -> bool {
        key == "id" || (key == "name" && self.name.is_some()) || self.extra.contains_key(key)
    }
}

/// Current sensor readings of one device
///
/// Channels are optional: an upstream `null` stays `null` on the wire and
/// is never turned into `0.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub current_temp1: Option<f64>,
    #[serde(default)]
    pub current_temp2: Option<f64>,
    #[serde(default)]
    pub current_hum: Option<f64>,
    /// Timestamp of the measurement, as formatted by the upstream
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reading {
    pub fn new(temp1: Option<f64>, temp2: Option<f64>, hum: Option<f64>) -> Self {
        Self {
            current_temp1: temp1,
            current_temp2: temp2,
            current_hum: hum,
            ..Default::default()
        }
    }

    pub fn last_update(mut self, timestamp: impl Into<String>) -> Self {
        self.last_update = Some(timestamp.into());
        self
    }
}

/// Outcome of a reading lookup that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceReading {
    Present(Reading),
    /// The upstream has no data for this device (or the lookup failed and
    /// the entry was degraded)
    Absent,
}

impl DeviceReading {
    pub fn is_absent(&self) -> bool {
        matches!(self, DeviceReading::Absent)
    }

    pub fn as_reading(&self) -> Option<&Reading> {
        match self {
            DeviceReading::Present(r) => Some(r),
            DeviceReading::Absent => None,
        }
    }
}

/// Body of `GET /users/{id}`
///
/// Only the device list is used; the rest of the user record is ignored.
/// The list may be `null` but must be present.
#[derive(Debug, Deserialize)]
pub(crate) struct UserRecord {
    #[serde(
        rename = "terrariumData",
        alias = "devices",
        deserialize_with = "nullable"
    )]
    pub devices: Option<Vec<DeviceRef>>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}
