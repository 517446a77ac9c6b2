//! Mock transport and sinks for testing.
//!
//! This module provides an in-memory [`GattTransport`] that can be used for
//! unit testing without requiring actual BLE hardware, plus collecting
//! implementations of [`RowSink`] and [`RecordPublisher`].
//!
//! # Features
//!
//! - **Failure injection**: refuse connections, fail writes, drop the link
//! - **Latency simulation**: delay connects to exercise timeouts
//! - **Automatic feeds**: push a payload at a fixed interval while connected

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::sink::{AggregatedRow, RecordPublisher, RowSink, SinkError};
use crate::transport::{GattConnection, GattTransport, NOTIFICATION_BUFFER, Notification};
use crate::util::addresses_match;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A simulated SensorTag.
///
/// Obtained from [`MockTransport::add`]; all control methods take `&self`
/// so tests can drive a peripheral while a session owns its connection.
pub struct MockPeripheral {
    address: String,
    visible: AtomicBool,
    connected: AtomicBool,
    /// Bumped on every connect; stale connections and feeds compare against it.
    epoch: AtomicU64,
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    connect_latency_ms: AtomicU64,
    io_latency_ms: AtomicU64,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    subscriptions: Mutex<Vec<Uuid>>,
    notifier: Mutex<Option<mpsc::Sender<Notification>>>,
    feeds: Mutex<Vec<(Uuid, Vec<u8>, Duration)>>,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("address", &self.address)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("connect_count", &self.connect_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockPeripheral {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            visible: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            fail_connect: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            io_latency_ms: AtomicU64::new(0),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
            feeds: Mutex::new(Vec::new()),
        }
    }

    /// The address this peripheral answers to.
    pub fn address(&self) -> &str {
        &self.address
    }

    // --- Test control methods ---

    /// Whether scans report this peripheral.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    /// Simulate the link going up or down.
    ///
    /// Going down closes the notification channel of the current connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            lock(&self.notifier).take();
        }
    }

    /// Refuse every connection attempt.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Fail every characteristic write.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Delay every connection attempt by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Delay every write, subscribe and disconnect by `latency`.
    pub fn set_io_latency(&self, latency: Duration) {
        self.io_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Push `payload` on `characteristic` every `interval` while connected
    /// and subscribed. Applies from the next connection on.
    pub fn feed(&self, characteristic: Uuid, payload: Vec<u8>, interval: Duration) {
        lock(&self.feeds).push((characteristic, payload, interval));
    }

    /// Deliver one notification to the current connection, if any.
    ///
    /// Returns `false` if nobody was listening.
    pub async fn push_notification(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        let sender = lock(&self.notifier).clone();
        match sender {
            Some(tx) => tx.send(Notification::new(characteristic, value)).await.is_ok(),
            None => false,
        }
    }

    /// Every write so far, oldest first.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// Every subscription so far, oldest first.
    pub fn subscriptions(&self) -> Vec<Uuid> {
        lock(&self.subscriptions).clone()
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Disconnect calls so far.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::Relaxed)
    }

    async fn io_delay(&self) {
        let ms = self.io_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch && self.is_connected()
    }

    fn spawn_feeds(self: &Arc<Self>, epoch: u64) {
        for (characteristic, payload, period) in lock(&self.feeds).clone() {
            let peripheral = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if !peripheral.is_current(epoch) {
                        break;
                    }
                    if lock(&peripheral.subscriptions).contains(&characteristic) {
                        peripheral
                            .push_notification(characteristic, payload.clone())
                            .await;
                    }
                }
            });
        }
    }
}

/// In-memory [`GattTransport`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use posture_core::{GattTransport, MockTransport};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let transport = MockTransport::new();
/// transport.add("54:6C:0E:53:3B:0A");
///
/// let conn = transport
///     .connect("54:6c:0e:53:3b:0a", Duration::from_secs(1))
///     .await
///     .unwrap();
/// assert!(conn.is_connected().await);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MockTransport {
    peripherals: Mutex<Vec<Arc<MockPeripheral>>>,
}

impl MockTransport {
    /// Create a transport with no peripherals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a visible peripheral and return its control handle.
    pub fn add(&self, address: &str) -> Arc<MockPeripheral> {
        let peripheral = Arc::new(MockPeripheral::new(address));
        lock(&self.peripherals).push(Arc::clone(&peripheral));
        peripheral
    }

    /// Control handle of a previously added peripheral.
    pub fn peripheral(&self, address: &str) -> Option<Arc<MockPeripheral>> {
        lock(&self.peripherals)
            .iter()
            .find(|p| addresses_match(&p.address, address))
            .cloned()
    }
}

#[async_trait]
impl GattTransport for MockTransport {
    async fn discover(&self, addresses: &[String], window: Duration) -> Result<HashSet<String>> {
        tokio::time::sleep(window).await;
        let peripherals = lock(&self.peripherals).clone();
        Ok(addresses
            .iter()
            .filter(|wanted| {
                peripherals
                    .iter()
                    .any(|p| p.visible.load(Ordering::Relaxed) && addresses_match(&p.address, wanted))
            })
            .cloned()
            .collect())
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn GattConnection>> {
        let peripheral = self
            .peripheral(address)
            .ok_or_else(|| Error::device_not_found(address))?;

        let latency = peripheral.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !peripheral.visible.load(Ordering::Relaxed) {
            return Err(Error::connect_failed(address, ConnectionFailureReason::OutOfRange));
        }
        if peripheral.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::connect_failed(address, ConnectionFailureReason::Rejected));
        }

        let epoch = peripheral.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&peripheral.notifier).take();
        peripheral.connected.store(true, Ordering::SeqCst);
        peripheral.connect_count.fetch_add(1, Ordering::Relaxed);
        peripheral.spawn_feeds(epoch);

        Ok(Box::new(MockConnection {
            address: address.to_string(),
            peripheral,
            epoch,
        }))
    }
}

/// Connection handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockConnection {
    address: String,
    peripheral: Arc<MockPeripheral>,
    epoch: u64,
}

impl MockConnection {
    fn check_connected(&self) -> Result<()> {
        if self.peripheral.is_current(self.epoch) {
            Ok(())
        } else {
            Err(Error::connection_lost(&self.address))
        }
    }
}

#[async_trait]
impl GattConnection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        self.check_connected()?;
        self.peripheral.io_delay().await;
        if self.peripheral.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::configure(characteristic, "mock write failure"));
        }
        lock(&self.peripheral.writes).push((characteristic, value.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        self.check_connected()?;
        self.peripheral.io_delay().await;
        lock(&self.peripheral.subscriptions).push(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>> {
        self.check_connected()?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        *lock(&self.peripheral.notifier) = Some(tx);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_current(self.epoch)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect_count.fetch_add(1, Ordering::Relaxed);
        self.peripheral.io_delay().await;
        if self.peripheral.epoch.load(Ordering::SeqCst) == self.epoch {
            self.peripheral.set_connected(false);
        }
        Ok(())
    }
}

/// [`RowSink`] collecting rows in memory. Clones share the rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<AggregatedRow>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows appended so far.
    pub fn rows(&self) -> Vec<AggregatedRow> {
        lock(&self.rows).clone()
    }
}

impl RowSink for MemorySink {
    fn append(&mut self, row: &AggregatedRow) -> std::result::Result<(), SinkError> {
        lock(&self.rows).push(row.clone());
        Ok(())
    }
}

/// [`RecordPublisher`] collecting records in memory. Clones share the records.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    records: Arc<Mutex<Vec<Map<String, Value>>>>,
    fail: Arc<AtomicBool>,
}

impl MemoryPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records published so far.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        lock(&self.records).clone()
    }

    /// Make every publish fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl RecordPublisher for MemoryPublisher {
    async fn publish(&self, record: &Map<String, Value>) -> std::result::Result<(), SinkError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(SinkError::Publish("mock publish failure".into()));
        }
        lock(&self.records).push(record.clone());
        Ok(())
    }
}
