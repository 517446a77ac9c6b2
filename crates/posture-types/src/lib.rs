//! Platform-agnostic types for TI SensorTag posture wearables.
//!
//! This crate holds everything that does not need a Bluetooth stack:
//!
//! - Body roles and device identities
//! - The closed set of sensor variants with their characteristics
//! - Per-device sensor selection and the control writes it implies
//! - Pure decoders from notification payloads to physical units
//! - UUID constants for the SensorTag GATT services
//!
//! # Example
//!
//! ```
//! use posture_types::{Measurement, SensorSet, SensorVariant, decode};
//!
//! let set = SensorSet::default();
//! assert!(set.contains(SensorVariant::Accelerometer));
//!
//! let lux = decode::decode(SensorVariant::Optical, &[0x64, 0x10]).unwrap();
//! assert_eq!(lux, Measurement::Light { lux: 2.0 });
//! ```

pub mod decode;
pub mod error;
pub mod sensors;
pub mod types;
pub mod uuid;

pub use error::{DecodeError, DecodeResult, ParseNameError, SensorSetError};
pub use sensors::{ControlWrite, SensorSet};
pub use types::{
    ControlValue, DeviceIdentity, IndicatorCode, Measurement, Reading, Role, SensorVariant,
    motion_bits,
};
pub use uuid as ble;
