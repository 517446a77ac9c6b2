//! Error types for posture-core.
//!
//! # Propagation
//!
//! | Error Type | Raised by | Effect |
//! |------------|-----------|--------|
//! | [`Error::Connect`] | session connect | fatal to the session, cohort restarts |
//! | [`Error::Configure`] | control writes, subscriptions, indicator | fatal to the session, cohort restarts |
//! | [`Error::Decode`] | notification handler | dropped and counted, session keeps streaming |
//! | [`Error::ConnectionLost`] | liveness check, closed notification stream | fatal to the session, cohort restarts |
//! | [`Error::SinkWrite`] | pipeline | fatal to the pipeline, cohort restarts |
//! | [`Error::Cancelled`] | any await point | normal shutdown, never reported as a failure |
//!
//! There is no per-device retry. Any fatal error tears down every session of
//! the cohort and the supervisor reconnects the whole set after a backoff.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use posture_types::DecodeError;

use crate::sink::SinkError;

/// Errors that can occur while running a sensor cohort.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Device unreachable or rejected the connection.
    #[error("Connection to {address} failed: {reason}")]
    Connect {
        /// The device address.
        address: String,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Writing a control characteristic or subscribing failed.
    #[error("Configuring characteristic {characteristic} failed: {reason}")]
    Configure {
        /// The characteristic being configured.
        characteristic: Uuid,
        /// The reason for the failure.
        reason: String,
    },

    /// Required GATT characteristic not found on the device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: Uuid,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Malformed notification payload.
    #[error("Invalid notification payload: {0}")]
    Decode(#[from] DecodeError),

    /// Liveness check failed or the transport closed the notification stream.
    #[error("Connection to {address} lost")]
    ConnectionLost {
        /// The device address.
        address: String,
    },

    /// Writing to an output sink failed.
    #[error("Sink write failed: {0}")]
    SinkWrite(#[from] SinkError),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A cohort task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Device is out of range.
    OutOfRange,
    /// Device rejected the connection.
    Rejected,
    /// Connection attempt timed out.
    Timeout,
    /// Generic BLE error.
    BleError(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Rejected => write!(f, "connection rejected by device"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with the given address is not known to the adapter.
    NotFound { identifier: String },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific address.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure with structured reason.
    pub fn connect_failed(address: impl Into<String>, reason: ConnectionFailureReason) -> Self {
        Self::Connect {
            address: address.into(),
            reason,
        }
    }

    /// Wrap a transport error raised while configuring `characteristic`.
    pub fn configure(characteristic: Uuid, source: impl std::fmt::Display) -> Self {
        Self::Configure {
            characteristic,
            reason: source.to_string(),
        }
    }

    /// Create a connection lost error.
    pub fn connection_lost(address: impl Into<String>) -> Self {
        Self::ConnectionLost {
            address: address.into(),
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: Uuid, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid,
            service_count,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error is a cooperative shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias using posture-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use posture_types::{SensorVariant, ble};

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found("AA:BB:CC:DD:EE:FF");
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));

        let err = Error::connection_lost("AA:BB");
        assert_eq!(err.to_string(), "Connection to AA:BB lost");

        let err = Error::timeout("connect", Duration::from_secs(15));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("15s"));

        let err = Error::characteristic_not_found(ble::IO_DATA, 4);
        assert!(err.to_string().contains("f000aa65"));
        assert!(err.to_string().contains("4 services"));
    }

    #[test]
    fn test_connect_reason_display() {
        let err = Error::connect_failed("AA:BB", ConnectionFailureReason::Timeout);
        assert_eq!(err.to_string(), "Connection to AA:BB failed: connection timed out");

        let err = Error::connect_failed("AA:BB", ConnectionFailureReason::BleError("busy".into()));
        assert!(err.to_string().contains("BLE error: busy"));
    }

    #[test]
    fn test_configure_wraps_source() {
        let source = Error::characteristic_not_found(ble::MOTION_CONFIG, 3);
        let err = Error::configure(ble::MOTION_CONFIG, &source);
        match err {
            Error::Configure {
                characteristic,
                reason,
            } => {
                assert_eq!(characteristic, ble::MOTION_CONFIG);
                assert!(reason.contains("not found"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_conversion() {
        let decode = DecodeError::BadLength {
            variant: SensorVariant::Optical,
            expected: 2,
            actual: 5,
        };
        let err: Error = decode.into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().contains("requires 2 bytes"));
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }

    #[test]
    fn test_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::connection_lost("x").is_cancelled());
    }
}
