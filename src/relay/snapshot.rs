//! Snapshots and their wire encoding
//!
//! A snapshot is the unit of broadcast: every device of a session paired
//! with its reading (or the absent marker) at one poll tick. On the wire it
//! is a JSON array of flat objects, device fields first:
//!
//! ```json
//! [
//!   {"id": 1, "name": "Gecko", "current_temp1": 24.5, "current_temp2": null, "current_hum": 55.0, "last_update": "..."},
//!   {"id": 2, "name": "Frog", "reading": null}
//! ]
//! ```

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use thiserror::Error;

use super::session::SessionKey;
use crate::upstream::{DeviceReading, DeviceRef};

/// One device and its reading at a tick
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub device: DeviceRef,
    pub reading: DeviceReading,
}

impl SnapshotEntry {
    pub fn new(device: DeviceRef, reading: DeviceReading) -> Self {
        Self { device, reading }
    }
}

impl Serialize for SnapshotEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let device = &self.device;
        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("id", &device.id)?;
        if let Some(name) = &device.name {
            map.serialize_entry("name", name)?;
        }
        let absent = self.reading.is_absent();
        for (key, value) in &device.extra {
            // The absent marker owns `reading`
            if absent && key == "reading" {
                continue;
            }
            map.serialize_entry(key, value)?;
        }

        match &self.reading {
            DeviceReading::Present(reading) => {
                // Device fields win on key collisions (e.g. the reading's own `id`)
                let channels = [
                    ("current_temp1", &reading.current_temp1),
                    ("current_temp2", &reading.current_temp2),
                    ("current_hum", &reading.current_hum),
                ];
                for (key, value) in channels {
                    if !device.has_field(key) {
                        map.serialize_entry(key, value)?;
                    }
                }
                if !device.has_field("last_update") {
                    map.serialize_entry("last_update", &reading.last_update)?;
                }
                for (key, value) in &reading.extra {
                    if !device.has_field(key) {
                        map.serialize_entry(key, value)?;
                    }
                }
            }
            DeviceReading::Absent => {
                map.serialize_entry("reading", &())?;
            }
        }

        map.end()
    }
}

/// Immutable aggregate of one poll tick for one session
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    session: SessionKey,
    taken_at: DateTime<Utc>,
    entries: Arc<[SnapshotEntry]>,
}

impl Snapshot {
    pub fn new(session: SessionKey, entries: Vec<SnapshotEntry>) -> Self {
        Self {
            session,
            taken_at: Utc::now(),
            entries: entries.into(),
        }
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of devices whose reading is absent
    pub fn absent_count(&self) -> usize {
        self.entries.iter().filter(|e| e.reading.is_absent()).count()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for entry in self.entries.iter() {
            seq.serialize_element(entry)?;
        }
        seq.end()
    }
}

/// Encoded snapshot, shared by every connection of a publish
pub type Payload = Arc<str>;

/// Snapshot encoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode snapshot: {0}")]
    Encode(String),
}

/// Turns a snapshot into the frame sent to clients
///
/// The broadcaster calls this once per publish, no matter how many
/// connections receive the result.
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, snapshot: &Snapshot) -> Result<Payload, CodecError>;
}

/// JSON array encoding used by the mobile client
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl SnapshotCodec for JsonCodec {
    fn encode(&self, snapshot: &Snapshot) -> Result<Payload, CodecError> {
        serde_json::to_string(snapshot)
            .map(Payload::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}
