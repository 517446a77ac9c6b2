//! btleplug-backed GATT transport.
//!
//! This is the production implementation of [`GattTransport`]. Discovery is a
//! timed scan followed by address matching over the adapter's known
//! peripherals; connections cache every characteristic after service
//! discovery and forward notifications into a bounded channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
use crate::transport::{GattConnection, GattTransport, NOTIFICATION_BUFFER, Notification};
use crate::util::{addresses_match, create_identifier};

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE characteristic write operations.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for enabling notifications and for disconnecting.
const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Transport over the host's first Bluetooth adapter.
#[derive(Clone)]
pub struct BleTransport {
    adapter: Adapter,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport").finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Open the first available adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            adapter: get_adapter().await?,
        })
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Search the adapter's known peripherals for one matching `address`.
    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                let identifier = create_identifier(&props.address.to_string(), &peripheral.id());
                if addresses_match(&identifier, address) {
                    debug!("Matched peripheral {}", identifier);
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl GattTransport for BleTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(expected = addresses.len(), window_secs = window.as_secs()))]
    async fn discover(&self, addresses: &[String], window: Duration) -> Result<HashSet<String>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(window).await;
        self.adapter.stop_scan().await?;

        let mut visible = HashSet::new();
        for peripheral in self.adapter.peripherals().await? {
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Error reading peripheral properties: {}", e);
                    continue;
                }
            };
            let identifier = create_identifier(&props.address.to_string(), &peripheral.id());
            for address in addresses {
                if addresses_match(&identifier, address) {
                    visible.insert(address.clone());
                }
            }
        }

        debug!("{}/{} expected devices visible", visible.len(), addresses.len());
        Ok(visible)
    }

    #[tracing::instrument(level = "info", skip(self), fields(timeout_secs = timeout.as_secs()))]
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn GattConnection>> {
        let peripheral = self
            .find_peripheral(address)
            .await?
            .ok_or_else(|| Error::device_not_found(address))?;

        let connection = BleConnection::open(peripheral, address, timeout).await?;
        Ok(Box::new(connection))
    }
}

/// One open btleplug connection.
///
/// Call [`GattConnection::disconnect`] before dropping; otherwise a
/// best-effort disconnect is spawned from `Drop`.
pub struct BleConnection {
    peripheral: Peripheral,
    address: String,
    characteristics: HashMap<Uuid, Characteristic>,
    service_count: usize,
    notification_handles: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for BleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleConnection")
            .field("address", &self.address)
            .field("characteristics", &self.characteristics.len())
            .finish_non_exhaustive()
    }
}

impl BleConnection {
    /// Connect, discover services and cache every characteristic.
    pub async fn open(peripheral: Peripheral, address: &str, connect_timeout: Duration) -> Result<Self> {
        info!("Connecting to {}...", address);
        match timeout(connect_timeout, peripheral.connect()).await {
            Err(_) => {
                return Err(Error::connect_failed(address, ConnectionFailureReason::Timeout));
            }
            Ok(Err(e)) => {
                return Err(Error::connect_failed(
                    address,
                    ConnectionFailureReason::BleError(e.to_string()),
                ));
            }
            Ok(Ok(())) => {}
        }
        info!("Connected to {}", address);

        timeout(DEFAULT_DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", DEFAULT_DISCOVERY_TIMEOUT))??;

        let services = peripheral.services();
        let mut characteristics = HashMap::new();
        for service in &services {
            debug!("  Service: {}", service.uuid);
            for characteristic in &service.characteristics {
                debug!("    Characteristic: {}", characteristic.uuid);
                characteristics.insert(characteristic.uuid, characteristic.clone());
            }
        }
        debug!("Cached {} characteristics", characteristics.len());

        Ok(Self {
            peripheral,
            address: address.to_string(),
            characteristics,
            service_count: services.len(),
            notification_handles: tokio::sync::Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| Error::characteristic_not_found(uuid, self.service_count))
    }
}

#[async_trait]
impl GattConnection for BleConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let target = self.find_characteristic(characteristic)?;
        timeout(
            DEFAULT_WRITE_TIMEOUT,
            self.peripheral.write(target, value, WriteType::WithResponse),
        )
        .await
        .map_err(|_| Error::timeout(format!("write characteristic {}", characteristic), DEFAULT_WRITE_TIMEOUT))??;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let target = self.find_characteristic(characteristic)?;
        timeout(DEFAULT_LINK_TIMEOUT, self.peripheral.subscribe(target))
            .await
            .map_err(|_| Error::timeout(format!("subscribe {}", characteristic), DEFAULT_LINK_TIMEOUT))??;
        Ok(())
    }

    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>> {
        let mut stream = self.peripheral.notifications().await?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);

        let handle = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(notification) = stream.next().await {
                let forwarded = Notification::new(notification.uuid, notification.value);
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        self.notification_handles.lock().await.push(handle);

        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    #[tracing::instrument(level = "info", skip(self), fields(address = %self.address))]
    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);

        {
            let mut handles = self.notification_handles.lock().await;
            for handle in handles.drain(..) {
                handle.abort();
            }
        }

        timeout(DEFAULT_LINK_TIMEOUT, self.peripheral.disconnect())
            .await
            .map_err(|_| Error::timeout("disconnect", DEFAULT_LINK_TIMEOUT))??;
        Ok(())
    }
}

impl Drop for BleConnection {
    fn drop(&mut self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(
            device_address = %self.address,
            "Connection dropped without disconnect() - performing best-effort cleanup"
        );

        if let Ok(mut handles) = self.notification_handles.try_lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }

        let peripheral = self.peripheral.clone();
        let address = self.address.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match timeout(DEFAULT_LINK_TIMEOUT, peripheral.disconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(device_address = %address, error = %e, "Best-effort disconnect failed");
                    }
                    Err(_) => debug!(device_address = %address, "Best-effort disconnect timed out"),
                }
            });
        }
    }
}
