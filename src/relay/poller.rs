//! Session Poller
//!
//! One poller per active session. Each tick fetches the session's device
//! list, fetches every device's current reading concurrently, assembles a
//! snapshot and hands it to the broadcaster.
//!
//! Failures never end the loop:
//! - directory failure: the tick is skipped, nothing is published
//! - reading failure: that device is published as absent

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::broadcaster::{Broadcaster, PublishError, PublishReport};
use super::session::SessionKey;
use super::snapshot::{Snapshot, SnapshotEntry};
use crate::upstream::{DeviceReading, DeviceSource, UpstreamError};

/// Lifecycle of a poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    /// Created, timer not armed yet
    Idle,
    /// Timer armed, ticking
    Running,
    /// Timer cancelled, no further upstream calls
    Stopped,
}

/// Counters for one poller
///
/// Fetch failures are recorded here rather than only logged, so operators
/// and tests can see how a session is doing.
#[derive(Debug)]
pub struct PollerStats {
    state: Mutex<PollerState>,
    ticks_completed: AtomicU64,
    ticks_skipped: AtomicU64,
    consecutive_skips: AtomicU64,
    readings_absent: AtomicU64,
    reading_failures: AtomicU64,
    publish_failures: AtomicU64,
    last_device_count: AtomicUsize,
    last_snapshot_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl Default for PollerStats {
    fn default() -> Self {
        Self {
            state: Mutex::new(PollerState::Idle),
            ticks_completed: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            consecutive_skips: AtomicU64::new(0),
            readings_absent: AtomicU64::new(0),
            reading_failures: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            last_device_count: AtomicUsize::new(0),
            last_snapshot_at: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }
}

impl PollerStats {
    pub fn state(&self) -> PollerState {
        *self.state.lock()
    }

    fn set_state(&self, state: PollerState) {
        *self.state.lock() = state;
    }

    /// Ticks that produced and published a snapshot
    pub fn ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::Relaxed)
    }

    /// Ticks abandoned because the device list could not be fetched
    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }

    /// Skipped ticks since the last published snapshot
    pub fn consecutive_skips(&self) -> u64 {
        self.consecutive_skips.load(Ordering::Relaxed)
    }

    /// Whether the most recent tick failed to produce a snapshot
    pub fn is_stale(&self) -> bool {
        self.consecutive_skips() > 0
    }

    /// Entries published as absent (no data or failed lookup)
    pub fn readings_absent(&self) -> u64 {
        self.readings_absent.load(Ordering::Relaxed)
    }

    /// Reading lookups that failed and were degraded to absent
    pub fn reading_failures(&self) -> u64 {
        self.reading_failures.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        *self.last_snapshot_at.lock()
    }

    /// Point-in-time copy for reporting
    pub fn report(&self) -> PollerReport {
        PollerReport {
            state: self.state(),
            ticks_completed: self.ticks_completed(),
            ticks_skipped: self.ticks_skipped(),
            consecutive_skips: self.consecutive_skips(),
            readings_absent: self.readings_absent(),
            reading_failures: self.reading_failures(),
            publish_failures: self.publish_failures(),
            last_device_count: self.last_device_count.load(Ordering::Relaxed),
            last_snapshot_at: self.last_snapshot_at(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Serializable view of [`PollerStats`]
#[derive(Debug, Clone, Serialize)]
pub struct PollerReport {
    pub state: PollerState,
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub consecutive_skips: u64,
    pub readings_absent: u64,
    pub reading_failures: u64,
    pub publish_failures: u64,
    pub last_device_count: usize,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Result of a single tick
#[derive(Debug)]
pub enum TickOutcome {
    Published(PublishReport),
    /// Device list unavailable, nothing published
    Skipped(UpstreamError),
    PublishFailed(PublishError),
}

/// Told when a publish left a session without connections
///
/// The broadcaster drops connections whose writes fail or time out. When
/// that removes the last one, nothing else will stop the session's poller.
pub trait SessionReaper: Send + Sync {
    fn session_emptied(&self, session: &SessionKey);
}

/// Polling loop for one session
pub struct Poller {
    session: SessionKey,
    source: Arc<dyn DeviceSource>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    stats: Arc<PollerStats>,
    reaper: Option<Weak<dyn SessionReaper>>,
}

impl Poller {
    pub fn new(
        session: SessionKey,
        source: Arc<dyn DeviceSource>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
    ) -> Self {
        Self {
            session,
            source,
            broadcaster,
            interval,
            stats: Arc::new(PollerStats::default()),
            reaper: None,
        }
    }

    /// Notify `reaper` when a publish drops the session's last connection
    ///
    /// Held weakly: the reaper usually owns this poller's handle.
    pub fn with_reaper(mut self, reaper: Weak<dyn SessionReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn stats(&self) -> &Arc<PollerStats> {
        &self.stats
    }

    /// Fetch devices and readings and assemble a snapshot
    ///
    /// Fails only if the device list cannot be fetched. Reading failures
    /// degrade the affected entries to [`DeviceReading::Absent`].
    pub async fn build_snapshot(&self) -> Result<Snapshot, UpstreamError> {
        let devices = self.source.fetch_devices(&self.session).await?;

        let lookups = devices.iter().map(|device| self.source.fetch_reading(&device.id));
        let readings = join_all(lookups).await;

        let mut entries = Vec::with_capacity(devices.len());
        for (device, result) in devices.into_iter().zip(readings) {
            let reading = match result {
                Ok(reading) => reading,
                Err(e) => {
                    tracing::debug!(
                        session = %self.session,
                        device_id = %device.id,
                        error = %e,
                        "Reading unavailable, publishing device as absent"
                    );
                    self.stats.reading_failures.fetch_add(1, Ordering::Relaxed);
                    DeviceReading::Absent
                }
            };
            entries.push(SnapshotEntry::new(device, reading));
        }

        Ok(Snapshot::new(self.session.clone(), entries))
    }

    /// Run one tick: build a snapshot and publish it
    pub async fn tick(&self) -> TickOutcome {
        let snapshot = match self.build_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    session = %self.session,
                    error = %e,
                    "Device list unavailable, skipping tick"
                );
                self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                self.stats.consecutive_skips.fetch_add(1, Ordering::Relaxed);
                *self.stats.last_error.lock() = Some(e.to_string());
                return TickOutcome::Skipped(e);
            }
        };

        self.stats
            .readings_absent
            .fetch_add(snapshot.absent_count() as u64, Ordering::Relaxed);
        self.stats
            .last_device_count
            .store(snapshot.len(), Ordering::Relaxed);

        match self.broadcaster.publish(&self.session, &snapshot).await {
            Ok(report) => {
                self.stats.ticks_completed.fetch_add(1, Ordering::Relaxed);
                self.stats.consecutive_skips.store(0, Ordering::Relaxed);
                *self.stats.last_snapshot_at.lock() = Some(snapshot.taken_at());
                tracing::debug!(
                    session = %self.session,
                    devices = snapshot.len(),
                    absent = snapshot.absent_count(),
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Tick complete"
                );
                if report.dropped > 0 {
                    self.reap_if_empty();
                }
                TickOutcome::Published(report)
            }
            Err(e) => {
                tracing::error!(session = %self.session, error = %e, "Failed to publish snapshot");
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                *self.stats.last_error.lock() = Some(e.to_string());
                TickOutcome::PublishFailed(e)
            }
        }
    }

    fn reap_if_empty(&self) {
        let remaining = self
            .broadcaster
            .registry()
            .session_connection_count(&self.session);
        if remaining == 0 {
            if let Some(reaper) = self.reaper.as_ref().and_then(Weak::upgrade) {
                reaper.session_emptied(&self.session);
            }
        }
    }

    /// Arm the timer and start ticking
    ///
    /// The first tick fires immediately, then once per interval. Ticks never
    /// overlap: a slow tick delays the next one instead of stacking up.
    pub fn spawn(self) -> PollerHandle {
        let session = self.session.clone();
        let stats = Arc::clone(&self.stats);
        stats.set_state(PollerState::Running);

        tracing::info!(
            session = %session,
            interval_ms = self.interval.as_millis() as u64,
            "Poller started"
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.tick().await;
            }
        });

        PollerHandle {
            session,
            task,
            stats,
        }
    }
}

/// Handle to a running poller
///
/// Dropping the handle stops the poller.
pub struct PollerHandle {
    session: SessionKey,
    task: JoinHandle<()>,
    stats: Arc<PollerStats>,
}

impl PollerHandle {
    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn stats(&self) -> &Arc<PollerStats> {
        &self.stats
    }

    pub fn state(&self) -> PollerState {
        self.stats.state()
    }

    /// Cancel the timer and any upstream calls still in flight
    pub fn stop(self) {
        // Drop does the work
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
        if self.stats.state() != PollerState::Stopped {
            self.stats.set_state(PollerState::Stopped);
            tracing::info!(session = %self.session, "Poller stopped");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::broadcaster::BroadcastConfig;
    use crate::relay::registry::{Connection, ConnectionRegistry};
    use crate::relay::snapshot::Payload;
    use crate::upstream::{DeviceId, DeviceRef, Reading, UpstreamResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// In-memory upstream with call counting
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub devices: Mutex<Option<Vec<DeviceRef>>>,
        pub readings: Mutex<HashMap<DeviceId, Option<Reading>>>,
        pub directory_calls: AtomicUsize,
        pub reading_calls: AtomicUsize,
    }

    impl FakeSource {
        pub fn with_devices(devices: Vec<DeviceRef>) -> Self {
            let source = Self::default();
            *source.devices.lock() = Some(devices);
            source
        }

        pub fn set_reading(&self, id: impl Into<DeviceId>, reading: Option<Reading>) {
            self.readings.lock().insert(id.into(), reading);
        }

        pub fn fail_directory(&self) {
            *self.devices.lock() = None;
        }

        pub fn calls(&self) -> usize {
            self.directory_calls.load(Ordering::SeqCst) + self.reading_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceSource for FakeSource {
        async fn fetch_devices(&self, _key: &SessionKey) -> UpstreamResult<Vec<DeviceRef>> {
            self.directory_calls.fetch_add(1, Ordering::SeqCst);
            let devices = self.devices.lock().clone();
            devices.ok_or_else(|| UpstreamError::Unavailable("directory down".to_string()))
        }

        /// Unknown devices time out; `None` means "no data yet"
        async fn fetch_reading(&self, id: &DeviceId) -> UpstreamResult<DeviceReading> {
            self.reading_calls.fetch_add(1, Ordering::SeqCst);
            let entry = self.readings.lock().get(id).cloned();
            match entry {
                Some(Some(reading)) => Ok(DeviceReading::Present(reading)),
                Some(None) => Ok(DeviceReading::Absent),
                None => Err(UpstreamError::Unavailable("request timed out".to_string())),
            }
        }
    }

    pub(crate) fn setup(
        source: Arc<FakeSource>,
        interval: Duration,
    ) -> (Poller, Arc<ConnectionRegistry>, mpsc::Receiver<Payload>) {
        let registry = Arc::new(ConnectionRegistry::default());
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            BroadcastConfig::default(),
        ));
        let session = SessionKey::new("1");

        let (tx, rx) = mpsc::channel(16);
        registry.register(Connection::new(session.clone(), tx)).unwrap();

        let poller = Poller::new(session, source, broadcaster, interval);
        (poller, registry, rx)
    }

    #[tokio::test]
    async fn test_failed_reading_is_absent() {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(1), DeviceRef::new(2)]));
        source.set_reading(1, Some(Reading::new(Some(24.5), None, Some(55.0))));
        let (poller, _registry, mut rx) = setup(Arc::clone(&source), Duration::from_secs(10));

        let outcome = poller.tick().await;
        assert!(matches!(outcome, TickOutcome::Published(PublishReport { delivered: 1, dropped: 0 })));

        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            value,
            serde_json::json!([
                {"id": 1, "current_temp1": 24.5, "current_temp2": null, "current_hum": 55.0, "last_update": null},
                {"id": 2, "reading": null}
            ])
        );

        assert_eq!(poller.stats().reading_failures(), 1);
        assert_eq!(poller.stats().readings_absent(), 1);
        assert_eq!(poller.stats().ticks_completed(), 1);
    }

    #[tokio::test]
    async fn test_no_data_is_absent_but_not_a_failure() {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(7)]));
        source.set_reading(7, None);
        let (poller, _registry, _rx) = setup(Arc::clone(&source), Duration::from_secs(10));

        let snapshot = poller.build_snapshot().await.unwrap();
        assert!(snapshot.entries()[0].reading.is_absent());
        assert_eq!(poller.stats().reading_failures(), 0);
    }

    #[tokio::test]
    async fn test_directory_failure_publishes_nothing() {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(1)]));
        source.set_reading(1, Some(Reading::new(Some(20.0), Some(21.0), Some(50.0))));
        let (poller, _registry, mut rx) = setup(Arc::clone(&source), Duration::from_secs(10));

        assert!(matches!(poller.tick().await, TickOutcome::Published(_)));
        assert!(rx.recv().await.is_some());

        source.fail_directory();
        let outcome = poller.tick().await;

        assert!(matches!(outcome, TickOutcome::Skipped(UpstreamError::Unavailable(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(poller.stats().ticks_skipped(), 1);
        assert_eq!(poller.stats().ticks_completed(), 1);
        assert!(poller.stats().is_stale());
        // No reading calls when the directory is down
        assert_eq!(source.reading_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_device_list_refreshed_each_tick() {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(1)]));
        source.set_reading(1, None);
        source.set_reading(2, None);
        let (poller, _registry, _rx) = setup(Arc::clone(&source), Duration::from_secs(10));

        assert_eq!(poller.build_snapshot().await.unwrap().len(), 1);

        *source.devices.lock() = Some(vec![DeviceRef::new(2), DeviceRef::new(1)]);
        let snapshot = poller.build_snapshot().await.unwrap();
        let ids: Vec<_> = snapshot.entries().iter().map(|e| e.device.id.clone()).collect();
        assert_eq!(ids, vec![DeviceId::Number(2), DeviceId::Number(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate_then_periodic() {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(1)]));
        source.set_reading(1, None);
        let (poller, _registry, mut rx) = setup(Arc::clone(&source), Duration::from_secs(10));
        let stats = Arc::clone(poller.stats());

        assert_eq!(stats.state(), PollerState::Idle);
        let handle = poller.spawn();
        assert_eq!(handle.state(), PollerState::Running);

        let start = tokio::time::Instant::now();
        rx.recv().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));

        handle.stop();
        assert_eq!(stats.state(), PollerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_upstream_calls() {
        let source = Arc::new(FakeSource::with_devices(vec![DeviceRef::new(1)]));
        source.set_reading(1, None);
        let interval = Duration::from_secs(10);
        let (poller, _registry, mut rx) = setup(Arc::clone(&source), interval);

        let handle = poller.spawn();
        rx.recv().await.unwrap();
        handle.stop();

        let calls = source.calls();
        tokio::time::sleep(interval * 2).await;
        assert_eq!(source.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_failures_do_not_end_loop() {
        let source = Arc::new(FakeSource::default());
        let interval = Duration::from_secs(10);
        let (poller, _registry, mut rx) = setup(Arc::clone(&source), interval);
        let stats = Arc::clone(poller.stats());

        let handle = poller.spawn();
        tokio::time::sleep(interval * 3 + Duration::from_millis(1)).await;
        assert_eq!(stats.ticks_skipped(), 4);
        assert!(rx.try_recv().is_err());

        *source.devices.lock() = Some(Vec::new());
        rx.recv().await.unwrap();
        assert_eq!(stats.ticks_completed(), 1);
        assert_eq!(stats.ticks_skipped(), 4);
        assert!(!stats.is_stale());
        drop(handle);
    }
}
