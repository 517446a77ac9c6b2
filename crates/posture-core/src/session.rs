//! One device's connection and notification stream.
//!
//! A [`DeviceSession`] connects, enables the configured sensors, subscribes
//! to their data characteristics and then decodes every notification into
//! its latest-reading snapshot. It is the only writer of that snapshot and of
//! its own readiness flag.
//!
//! ```text
//! Connecting -> Configuring -> Streaming -> Disconnected   (fatal error)
//!                                        -> Stopped        (cancellation)
//! ```
//!
//! There is no way back to `Streaming`: recovery happens at cohort level.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use posture_types::decode::decode_reading;
use posture_types::{DeviceIdentity, IndicatorCode, Reading, SensorSet, SensorVariant, ble};

use crate::barrier::ReadinessBarrier;
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::{CohortEvent, EventDispatcher};
use crate::feedback::WarningFlag;
use crate::transport::{GattConnection, GattTransport, Notification};

/// Default connect budget.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default liveness polling interval.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the disconnect issued by [`DeviceSession::stop`].
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Opening the BLE link.
    Connecting,
    /// Writing control characteristics and subscribing.
    Configuring,
    /// Receiving notifications.
    Streaming,
    /// Terminated by an error.
    Disconnected,
    /// Terminated by cancellation or `stop()`.
    Stopped,
}

impl SessionState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Configuring => "configuring",
            SessionState::Streaming => "streaming",
            SessionState::Disconnected => "disconnected",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Static configuration of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which device and where it is worn.
    pub identity: DeviceIdentity,
    /// Sensors to enable.
    pub sensors: SensorSet,
    /// Code shown while the posture warning is active. `None` leaves the
    /// IO service untouched.
    pub indicator: Option<IndicatorCode>,
    /// Connect budget.
    pub connect_timeout: Duration,
    /// How often the link is checked.
    pub liveness_interval: Duration,
}

impl SessionConfig {
    /// Configuration with default timeouts and no indicator.
    pub fn new(identity: DeviceIdentity, sensors: SensorSet) -> Self {
        Self {
            identity,
            sensors,
            indicator: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
        }
    }

    /// Drive the LED/buzzer with `code` while the warning is active.
    #[must_use]
    pub fn indicator(mut self, code: IndicatorCode) -> Self {
        self.indicator = Some(code);
        self
    }

    /// Set the connect budget.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the liveness polling interval.
    #[must_use]
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }
}

/// Latest reading per variant, as seen by readers of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Newest reading for every variant that has produced one.
    pub latest: BTreeMap<SensorVariant, Reading>,
    /// Incremented once per decoded notification.
    pub sequence: u64,
}

impl DeviceSnapshot {
    /// Whether nothing has been decoded yet.
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Counters kept for the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Notifications received.
    pub notifications: u64,
    /// Notifications dropped because they did not decode.
    pub dropped: u64,
}

/// One device's session.
pub struct DeviceSession {
    config: SessionConfig,
    barrier: ReadinessBarrier,
    events: EventDispatcher,
    warning: WarningFlag,
    state: watch::Sender<SessionState>,
    snapshot: watch::Sender<DeviceSnapshot>,
    connection: Option<Arc<dyn GattConnection>>,
    stopped: AtomicBool,
    notifications: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.config.identity)
            .field("state", &*self.state.borrow())
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Create a session. Nothing happens until [`run`](Self::run).
    pub fn new(
        config: SessionConfig,
        barrier: ReadinessBarrier,
        events: EventDispatcher,
        warning: WarningFlag,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        let (snapshot, _) = watch::channel(DeviceSnapshot::default());
        Self {
            config,
            barrier,
            events,
            warning,
            state,
            snapshot,
            connection: None,
            stopped: AtomicBool::new(false),
            notifications: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// The device this session owns.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.config.identity
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Read-only view of the latest readings.
    pub fn snapshots(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    /// Counters so far.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            notifications: self.notifications.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Run the session until cancellation or a fatal error.
    ///
    /// Returns `Ok(())` when stopped through `cancel` (state `Stopped`). Any
    /// other outcome clears this device's readiness flag, moves the session
    /// to `Disconnected` and returns the error. Undecodable notifications are
    /// never fatal.
    #[tracing::instrument(level = "info", skip_all, fields(role = %self.config.identity.role, address = %self.config.identity.address))]
    pub async fn run(&mut self, transport: &dyn GattTransport, cancel: &CancellationToken) -> Result<()> {
        let result = self.drive(transport, cancel).await;
        match result {
            Ok(()) | Err(Error::Cancelled) => {
                self.set_state(SessionState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.barrier.clear(&self.config.identity);
                self.set_state(SessionState::Disconnected);
                warn!(error = %e, "session terminated");
                Err(e)
            }
        }
    }

    /// Best-effort teardown. Never fails; only the first call reaches the
    /// transport.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Stopped;
                true
            }
        });

        if let Some(conn) = &self.connection {
            match timeout(TEARDOWN_TIMEOUT, conn.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(device = %self.config.identity, error = %e, "disconnect during teardown failed");
                }
                Err(_) => {
                    warn!(device = %self.config.identity, "disconnect during teardown timed out after {:?}", TEARDOWN_TIMEOUT);
                }
            }
        }

        let stats = self.stats();
        info!(
            device = %self.config.identity,
            notifications = stats.notifications,
            dropped = stats.dropped,
            "session stopped"
        );
    }

    /// Check the link once.
    ///
    /// On loss the readiness flag is cleared and
    /// [`Error::ConnectionLost`] returned.
    pub async fn poll_liveness(&self) -> Result<()> {
        let alive = match &self.connection {
            Some(conn) => conn.is_connected().await,
            None => false,
        };
        if alive {
            Ok(())
        } else {
            self.barrier.clear(&self.config.identity);
            Err(Error::connection_lost(&self.config.identity.address))
        }
    }

    async fn drive(&mut self, transport: &dyn GattTransport, cancel: &CancellationToken) -> Result<()> {
        info!(device = %self.config.identity, "connecting");
        self.events.send(CohortEvent::SessionState {
            identity: self.config.identity.clone(),
            state: SessionState::Connecting,
        });
        let address = self.config.identity.address.clone();
        let budget = self.config.connect_timeout;

        let conn = cancellable(cancel, async {
            match timeout(budget, transport.connect(&address, budget)).await {
                Ok(result) => result,
                Err(_) => Err(Error::connect_failed(&address, ConnectionFailureReason::Timeout)),
            }
        })
        .await?;
        let conn: Arc<dyn GattConnection> = Arc::from(conn);
        self.connection = Some(Arc::clone(&conn));

        self.set_state(SessionState::Configuring);
        let (notifications, warning) = cancellable(cancel, async {
            match timeout(budget, self.configure(conn.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!("configure {}", address), budget)),
            }
        })
        .await?;

        self.set_state(SessionState::Streaming);
        self.stream(conn.as_ref(), notifications, warning, cancel).await
    }

    /// Enable the sensors, subscribe and arm the indicator.
    ///
    /// The warning receiver is created before the first indicator write so
    /// no change is lost between configuration and streaming.
    async fn configure(
        &self,
        conn: &dyn GattConnection,
    ) -> Result<(mpsc::Receiver<Notification>, Option<watch::Receiver<bool>>)> {
        let notifications = conn.notifications().await?;

        for write in self.config.sensors.control_writes() {
            debug!(characteristic = %write.characteristic, value = ?write.value, "enabling sensor");
            conn.write(write.characteristic, &write.value)
                .await
                .map_err(|e| Error::configure(write.characteristic, e))?;
        }

        for characteristic in self.config.sensors.data_characteristics() {
            conn.subscribe(characteristic)
                .await
                .map_err(|e| Error::configure(characteristic, e))?;
        }

        let mut warning = None;
        if self.config.indicator.is_some() {
            conn.write(ble::IO_CONFIG, &[ble::IO_REMOTE_MODE])
                .await
                .map_err(|e| Error::configure(ble::IO_CONFIG, e))?;
            let mut rx = self.warning.subscribe();
            let active = *rx.borrow_and_update();
            self.write_indicator(conn, active).await?;
            warning = Some(rx);
        }

        info!(sensors = ?self.config.sensors.iter().collect::<Vec<_>>(), "sensors enabled");
        Ok((notifications, warning))
    }

    async fn stream(
        &self,
        conn: &dyn GattConnection,
        mut notifications: mpsc::Receiver<Notification>,
        mut warning: Option<watch::Receiver<bool>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut liveness = interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                received = notifications.recv() => match received {
                    Some(notification) => self.handle_notification(notification),
                    None => {
                        self.barrier.clear(&self.config.identity);
                        return Err(Error::connection_lost(&self.config.identity.address));
                    }
                },
                _ = liveness.tick() => self.poll_liveness().await?,
                Some(active) = next_warning(&mut warning) => {
                    cancellable(cancel, self.write_indicator(conn, active)).await?;
                }
            }
        }
    }

    fn handle_notification(&self, notification: Notification) {
        self.notifications.fetch_add(1, Ordering::Relaxed);

        let variants = self.config.sensors.variants_for(notification.characteristic);
        if variants.is_empty() {
            debug!(characteristic = %notification.characteristic, "notification for unconfigured characteristic");
            return;
        }

        let now = OffsetDateTime::now_utc();
        let mut readings = Vec::with_capacity(variants.len());
        for variant in variants {
            match decode_reading(variant, &notification.value, now) {
                Ok(reading) => readings.push(reading),
                Err(e) => debug!(error = %e, "decode failed"),
            }
        }

        if readings.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                device = %self.config.identity,
                len = notification.value.len(),
                "dropping malformed notification"
            );
            return;
        }

        self.snapshot.send_modify(|snapshot| {
            for reading in readings {
                snapshot.latest.insert(reading.variant, reading);
            }
            snapshot.sequence += 1;
        });
        self.barrier.set(&self.config.identity);
    }

    async fn write_indicator(&self, conn: &dyn GattConnection, active: bool) -> Result<()> {
        let Some(code) = self.config.indicator else {
            return Ok(());
        };
        let code = if active { code } else { IndicatorCode::Off };
        debug!(?code, "writing indicator");
        conn.write(ble::IO_DATA, &[code.as_byte()])
            .await
            .map_err(|e| Error::configure(ble::IO_DATA, e))
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(device = %self.config.identity, state = %next, "session state");
            self.events.send(CohortEvent::SessionState {
                identity: self.config.identity.clone(),
                state: next,
            });
        }
    }
}

/// Race `fut` against `cancel`.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Next warning change, or never if no indicator is configured.
async fn next_warning(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(receiver) => match receiver.changed().await {
            Ok(()) => Some(*receiver.borrow_and_update()),
            Err(_) => {
                *rx = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockTransport;
    use posture_types::Role;

    fn motion_payload(raw: [i16; 9]) -> Vec<u8> {
        raw.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    struct Harness {
        transport: Arc<MockTransport>,
        barrier: ReadinessBarrier,
        warning: WarningFlag,
        identity: DeviceIdentity,
    }

    impl Harness {
        fn new() -> Self {
            let identity = DeviceIdentity::new("54:6C:0E:53:3B:0A", Role::Neck);
            let transport = Arc::new(MockTransport::new());
            transport.add(&identity.address);
            Self {
                transport,
                barrier: ReadinessBarrier::new([identity.clone()]),
                warning: WarningFlag::new(),
                identity,
            }
        }

        fn session(&self, config: SessionConfig) -> DeviceSession {
            DeviceSession::new(
                config,
                self.barrier.clone(),
                EventDispatcher::default(),
                self.warning.clone(),
            )
        }

        fn config(&self) -> SessionConfig {
            SessionConfig::new(self.identity.clone(), SensorSet::default())
                .liveness_interval(Duration::from_millis(200))
        }

        fn spawn(&self, mut session: DeviceSession, cancel: CancellationToken) -> tokio::task::JoinHandle<(DeviceSession, Result<()>)> {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let result = session.run(transport.as_ref(), &cancel).await;
                (session, result)
            })
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == want))
            .await
            .expect("state reached")
            .expect("session alive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_configures_and_streams() {
        let h = Harness::new();
        let session = h.session(h.config());
        let mut state = session.subscribe_state();
        let mut snapshots = session.snapshots();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());

        wait_state(&mut state, SessionState::Streaming).await;
        let device = h.transport.peripheral(&h.identity.address).unwrap();
        assert_eq!(
            device.writes(),
            vec![(ble::MOTION_CONFIG, vec![0x7F, 0x01])]
        );
        assert_eq!(device.subscriptions(), vec![ble::MOTION_DATA]);
        assert!(!h.barrier.is_set(&h.identity));

        device
            .push_notification(ble::MOTION_DATA, motion_payload([0, 0, 0, 16384, 0, 0, 0, 0, 0]))
            .await;
        snapshots.changed().await.unwrap();
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.latest.len(), 3);
        let accel = &snapshot.latest[&SensorVariant::Accelerometer];
        assert_eq!(accel.measurement.values()[0], 4.0);
        assert!(h.barrier.is_set(&h.identity));

        cancel.cancel();
        let (session, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_notification_is_dropped() {
        let h = Harness::new();
        let session = h.session(h.config());
        let mut state = session.subscribe_state();
        let mut snapshots = session.snapshots();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());

        wait_state(&mut state, SessionState::Streaming).await;
        let device = h.transport.peripheral(&h.identity.address).unwrap();
        device.push_notification(ble::MOTION_DATA, vec![1, 2, 3]).await;
        device
            .push_notification(ble::MOTION_DATA, motion_payload([1; 9]))
            .await;

        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow().sequence, 1);

        cancel.cancel();
        let (session, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(
            session.stats(),
            SessionStats {
                notifications: 2,
                dropped: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_is_fatal() {
        let h = Harness::new();
        let session = h.session(h.config());
        let mut state = session.subscribe_state();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());

        wait_state(&mut state, SessionState::Streaming).await;
        let device = h.transport.peripheral(&h.identity.address).unwrap();
        device
            .push_notification(ble::MOTION_DATA, motion_payload([0; 9]))
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.barrier.is_set(&h.identity) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        device.set_connected(false);
        let (session, result) = task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost { .. })));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!h.barrier.is_set(&h.identity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure() {
        let h = Harness::new();
        h.transport
            .peripheral(&h.identity.address)
            .unwrap()
            .fail_connect(true);
        let session = h.session(h.config());
        let (session, result) = h.spawn(session, CancellationToken::new()).await.unwrap();
        assert!(matches!(result, Err(Error::Connect { .. })));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_configure_error() {
        let h = Harness::new();
        h.transport
            .peripheral(&h.identity.address)
            .unwrap()
            .fail_writes(true);
        let session = h.session(h.config());
        let (_, result) = h.spawn(session, CancellationToken::new()).await.unwrap();
        match result {
            Err(Error::Configure { characteristic, .. }) => {
                assert_eq!(characteristic, ble::MOTION_CONFIG)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let h = Harness::new();
        let session = h.session(h.config());
        let mut state = session.subscribe_state();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());
        wait_state(&mut state, SessionState::Streaming).await;

        cancel.cancel();
        let (session, _) = task.await.unwrap();
        session.stop().await;
        session.stop().await;

        let device = h.transport.peripheral(&h.identity.address).unwrap();
        assert_eq!(device.disconnect_count(), 1);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_is_harmless() {
        let h = Harness::new();
        let session = h.session(h.config());
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        let device = h.transport.peripheral(&h.identity.address).unwrap();
        assert_eq!(device.disconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indicator_follows_warning() {
        let h = Harness::new();
        let config = h.config().indicator(IndicatorCode::RedBuzzer);
        let session = h.session(config);
        let mut state = session.subscribe_state();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());
        wait_state(&mut state, SessionState::Streaming).await;

        let device = h.transport.peripheral(&h.identity.address).unwrap();
        assert!(device.writes().contains(&(ble::IO_CONFIG, vec![0x01])));
        assert_eq!(device.writes().last(), Some(&(ble::IO_DATA, vec![0x00])));

        h.warning.set(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while device.writes().last() != Some(&(ble::IO_DATA, vec![0x05])) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        let (_, result) = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_configure_times_out() {
        let h = Harness::new();
        h.transport
            .peripheral(&h.identity.address)
            .unwrap()
            .set_io_latency(Duration::from_secs(3600));
        let session = h.session(h.config().connect_timeout(Duration::from_secs(5)));

        let started = tokio::time::Instant::now();
        let (session, result) = h.spawn(session, CancellationToken::new()).await.unwrap();
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_stalled_configure() {
        let h = Harness::new();
        let device = h.transport.peripheral(&h.identity.address).unwrap();
        device.set_io_latency(Duration::from_secs(3600));
        let session = h.session(h.config().connect_timeout(Duration::from_secs(7200)));
        let mut state = session.subscribe_state();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());
        wait_state(&mut state, SessionState::Configuring).await;

        cancel.cancel();
        let (session, result) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session ignored cancellation")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(device.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_bounds_stalled_disconnect() {
        let h = Harness::new();
        let session = h.session(h.config());
        let mut state = session.subscribe_state();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());
        wait_state(&mut state, SessionState::Streaming).await;

        cancel.cancel();
        let (session, _) = task.await.unwrap();
        let device = h.transport.peripheral(&h.identity.address).unwrap();
        device.set_io_latency(Duration::from_secs(3600));

        let started = tokio::time::Instant::now();
        session.stop().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= TEARDOWN_TIMEOUT);
        assert!(elapsed < Duration::from_secs(60));
        assert_eq!(device.disconnect_count(), 1);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_stalled_indicator_write() {
        let h = Harness::new();
        let config = h.config().indicator(IndicatorCode::RedBuzzer);
        let session = h.session(config);
        let mut state = session.subscribe_state();
        let cancel = CancellationToken::new();
        let task = h.spawn(session, cancel.clone());
        wait_state(&mut state, SessionState::Streaming).await;

        let device = h.transport.peripheral(&h.identity.address).unwrap();
        let writes = device.writes().len();
        device.set_io_latency(Duration::from_secs(3600));
        h.warning.set(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let (session, result) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("indicator write blocked cancellation")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(device.writes().len(), writes);
    }
}
