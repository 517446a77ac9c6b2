//! Trait abstractions over the platform BLE stack.
//!
//! A [`GattTransport`] finds devices and opens connections; a
//! [`GattConnection`] is one open link. Sessions only talk to these traits so
//! the same code runs against [`crate::ble::BleTransport`] and
//! [`crate::mock::MockTransport`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Capacity of the per-connection notification channel.
pub const NOTIFICATION_BUFFER: usize = 64;

/// One raw notification pushed by a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The data characteristic that produced the value.
    pub characteristic: Uuid,
    /// Raw payload.
    pub value: Vec<u8>,
}

impl Notification {
    /// Create a notification.
    pub fn new(characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
        }
    }
}

/// Something that can discover peripherals and connect to them by address.
///
/// # Example
///
/// ```ignore
/// use posture_core::GattTransport;
///
/// async fn connect_all<T: GattTransport>(transport: &T, addresses: &[String]) -> posture_core::Result<()> {
///     let visible = transport.discover(addresses, Duration::from_secs(5)).await?;
///     for address in visible {
///         let conn = transport.connect(&address, Duration::from_secs(15)).await?;
///         conn.disconnect().await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Scan for `window` and return the subset of `addresses` currently visible.
    ///
    /// Returned strings are the caller's spelling of each address.
    async fn discover(&self, addresses: &[String], window: Duration) -> Result<HashSet<String>>;

    /// Open a connection and discover its characteristics.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn GattConnection>>;
}

/// An open GATT connection, exclusively owned by one session.
#[async_trait]
pub trait GattConnection: Send + Sync {
    /// The address this connection was opened with.
    fn address(&self) -> &str;

    /// Write a characteristic with response.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Channel receiving every notification for this connection, in arrival order.
    ///
    /// The channel closes when the link goes away.
    async fn notifications(&self) -> Result<mpsc::Receiver<Notification>>;

    /// Whether the transport still reports the link as up.
    async fn is_connected(&self) -> bool;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<()>;
}
