//! Error types for telemetry decoding and sensor configuration.

use thiserror::Error;

use crate::types::SensorVariant;

/// Errors produced while decoding a raw notification payload.
///
/// Decoding is pure arithmetic over fixed-size payloads, so the only
/// failure is a payload of the wrong size.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Payload length does not match the variant's wire format.
    #[error("{variant} payload requires {expected} bytes, got {actual}")]
    BadLength {
        /// The variant being decoded.
        variant: SensorVariant,
        /// Expected payload size.
        expected: usize,
        /// Actual payload size received.
        actual: usize,
    },
}

/// Errors produced when building a [`crate::SensorSet`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SensorSetError {
    /// No sensors were requested.
    #[error("a device must enable at least one sensor")]
    Empty,

    /// Two variants want the same characteristic pair with different firmware modes.
    #[error("{first} and {second} share a characteristic and cannot be enabled together")]
    Conflict {
        /// The first conflicting variant.
        first: SensorVariant,
        /// The second conflicting variant.
        second: SensorVariant,
    },
}

/// Error returned when parsing a text name fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseNameError {
    /// Unknown wearing position.
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    /// Unknown sensor variant.
    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),

    /// Indicator code outside `0..=7`.
    #[error("invalid indicator code {0}")]
    InvalidIndicator(u8),
}

/// Result type alias for decoding.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
