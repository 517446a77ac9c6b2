//! Core types for posture sensor data.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseNameError;
use crate::uuid as ble;

/// Where on the body a sensor is worn.
///
/// The role is the join key used in column and JSON field names, so it must
/// be unique within a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Role {
    /// Base of the neck.
    Neck,
    /// Middle of the back (thoracic).
    BackMid,
    /// Lower back (lumbar).
    BackLow,
    /// Left shoulder.
    ShoulderLeft,
    /// Right shoulder.
    ShoulderRight,
}

impl Role {
    /// All roles in canonical order.
    pub const ALL: [Role; 5] = [
        Role::Neck,
        Role::BackMid,
        Role::BackLow,
        Role::ShoulderLeft,
        Role::ShoulderRight,
    ];

    /// The display label, e.g. `"back-mid"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Neck => "neck",
            Role::BackMid => "back-mid",
            Role::BackLow => "back-low",
            Role::ShoulderLeft => "shoulder-left",
            Role::ShoulderRight => "shoulder-right",
        }
    }

    /// Suffix used in CSV columns and JSON keys, e.g. `"back_mid"`.
    ///
    /// ```
    /// use posture_types::Role;
    ///
    /// assert_eq!(Role::ShoulderLeft.field_suffix(), "shoulder_left");
    /// assert_eq!(Role::Neck.field_suffix(), "neck");
    /// ```
    #[must_use]
    pub fn field_suffix(&self) -> &'static str {
        match self {
            Role::Neck => "neck",
            Role::BackMid => "back_mid",
            Role::BackLow => "back_low",
            Role::ShoulderLeft => "shoulder_left",
            Role::ShoulderRight => "shoulder_right",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseNameError;

    /// Accepts the kebab label, the snake suffix and a few short aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "neck" => Ok(Role::Neck),
            "back-mid" | "back" | "mid-back" => Ok(Role::BackMid),
            "back-low" | "low-back" | "lumbar" => Ok(Role::BackLow),
            "shoulder-left" | "left-shoulder" | "shoulder-l" => Ok(Role::ShoulderLeft),
            "shoulder-right" | "right-shoulder" | "shoulder-r" => Ok(Role::ShoulderRight),
            _ => Err(ParseNameError::UnknownRole(s.to_string())),
        }
    }
}

/// Identity of one wearable device: its BLE address plus the role it plays.
///
/// Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    /// The role comes first so that ordered collections sort by body position.
    pub role: Role,
    /// BLE address (MAC on Linux/Windows, CoreBluetooth UUID on macOS).
    pub address: String,
}

impl DeviceIdentity {
    /// Create a new identity.
    pub fn new(address: impl Into<String>, role: Role) -> Self {
        Self {
            role,
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.role, self.address)
    }
}

/// Bitmask values for the MPU-9250 movement control register.
pub mod motion_bits {
    /// Enable gyroscope X, Y and Z.
    pub const GYRO_XYZ: u16 = 0x0007;
    /// Enable accelerometer X, Y and Z.
    pub const ACCEL_XYZ: u16 = 0x0007 << 3;
    /// Enable the magnetometer (all axes).
    pub const MAG_XYZ: u16 = 1 << 6;
    /// Accelerometer range ±2 g.
    pub const ACCEL_RANGE_2G: u16 = 0 << 8;
    /// Accelerometer range ±4 g.
    pub const ACCEL_RANGE_4G: u16 = 1 << 8;
    /// Accelerometer range ±8 g.
    pub const ACCEL_RANGE_8G: u16 = 2 << 8;
    /// Accelerometer range ±16 g.
    pub const ACCEL_RANGE_16G: u16 = 3 << 8;
}

/// The value a variant contributes to its control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue {
    /// Bits OR'ed into a 16-bit little-endian register shared by several variants.
    Bitmask(u16),
    /// A single enable byte (`0x01`).
    Enable,
}

/// A sensor available on the SensorTag.
///
/// Closed set: every variant owns its characteristic pair, its control value,
/// its wire size and its output field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SensorVariant {
    /// Accelerometer slice of the 9-axis movement payload (g).
    Accelerometer,
    /// Gyroscope slice of the 9-axis movement payload (deg/s).
    Gyroscope,
    /// Magnetometer slice of the 9-axis movement payload (µT).
    Magnetometer,
    /// Orientation quaternion from the fusion firmware.
    Quaternion,
    /// Ambient temperature (°C) and relative humidity (%).
    Humidity,
    /// Temperature (°C) and pressure (mbar).
    Barometer,
    /// Ambient light (lux).
    Optical,
}

impl SensorVariant {
    /// All variants in canonical order.
    pub const ALL: [SensorVariant; 7] = [
        SensorVariant::Accelerometer,
        SensorVariant::Gyroscope,
        SensorVariant::Magnetometer,
        SensorVariant::Quaternion,
        SensorVariant::Humidity,
        SensorVariant::Barometer,
        SensorVariant::Optical,
    ];

    /// Lower-case name used in configuration files.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorVariant::Accelerometer => "accelerometer",
            SensorVariant::Gyroscope => "gyroscope",
            SensorVariant::Magnetometer => "magnetometer",
            SensorVariant::Quaternion => "quaternion",
            SensorVariant::Humidity => "humidity",
            SensorVariant::Barometer => "barometer",
            SensorVariant::Optical => "optical",
        }
    }

    /// Whether the variant is a slice of the shared 9-axis movement payload.
    #[must_use]
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            SensorVariant::Accelerometer | SensorVariant::Gyroscope | SensorVariant::Magnetometer
        )
    }

    /// The characteristic that delivers notifications for this variant.
    #[must_use]
    pub fn data_characteristic(&self) -> Uuid {
        match self {
            SensorVariant::Accelerometer
            | SensorVariant::Gyroscope
            | SensorVariant::Magnetometer => ble::MOTION_DATA,
            SensorVariant::Quaternion => ble::QUATERNION_DATA,
            SensorVariant::Barometer => ble::BAROMETER_DATA,
            SensorVariant::Humidity => ble::HUMIDITY_DATA,
            SensorVariant::Optical => ble::OPTICAL_DATA,
        }
    }

    /// The characteristic written to enable this variant.
    #[must_use]
    pub fn control_characteristic(&self) -> Uuid {
        match self {
            SensorVariant::Accelerometer
            | SensorVariant::Gyroscope
            | SensorVariant::Magnetometer => ble::MOTION_CONFIG,
            SensorVariant::Quaternion => ble::QUATERNION_CONFIG,
            SensorVariant::Barometer => ble::BAROMETER_CONFIG,
            SensorVariant::Humidity => ble::HUMIDITY_CONFIG,
            SensorVariant::Optical => ble::OPTICAL_CONFIG,
        }
    }

    /// The value this variant contributes to its control characteristic.
    ///
    /// ```
    /// use posture_types::{ControlValue, SensorVariant};
    ///
    /// assert_eq!(SensorVariant::Accelerometer.control_value(), ControlValue::Bitmask(0x0138));
    /// assert_eq!(SensorVariant::Quaternion.control_value(), ControlValue::Bitmask(0x017F));
    /// assert_eq!(SensorVariant::Optical.control_value(), ControlValue::Enable);
    /// ```
    #[must_use]
    pub fn control_value(&self) -> ControlValue {
        use motion_bits::*;

        match self {
            SensorVariant::Gyroscope => ControlValue::Bitmask(GYRO_XYZ),
            SensorVariant::Accelerometer => ControlValue::Bitmask(ACCEL_XYZ | ACCEL_RANGE_4G),
            SensorVariant::Magnetometer => ControlValue::Bitmask(MAG_XYZ),
            SensorVariant::Quaternion => {
                ControlValue::Bitmask(GYRO_XYZ | ACCEL_XYZ | MAG_XYZ | ACCEL_RANGE_4G)
            }
            SensorVariant::Humidity | SensorVariant::Barometer | SensorVariant::Optical => {
                ControlValue::Enable
            }
        }
    }

    /// Exact notification size in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            SensorVariant::Accelerometer
            | SensorVariant::Gyroscope
            | SensorVariant::Magnetometer => crate::decode::MOTION_PAYLOAD_LEN,
            SensorVariant::Quaternion => crate::decode::QUATERNION_PAYLOAD_LEN,
            SensorVariant::Humidity => crate::decode::HUMIDITY_PAYLOAD_LEN,
            SensorVariant::Barometer => crate::decode::BAROMETER_PAYLOAD_LEN,
            SensorVariant::Optical => crate::decode::OPTICAL_PAYLOAD_LEN,
        }
    }

    /// Names of the decoded values, in the order of [`Measurement::values`].
    #[must_use]
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            SensorVariant::Accelerometer => &["acc_x", "acc_y", "acc_z"],
            SensorVariant::Gyroscope => &["gyro_x", "gyro_y", "gyro_z"],
            SensorVariant::Magnetometer => &["mag_x", "mag_y", "mag_z"],
            SensorVariant::Quaternion => &["q0", "q1", "q2", "q3"],
            SensorVariant::Humidity => &["humidity_temp", "humidity"],
            SensorVariant::Barometer => &["baro_temp", "pressure"],
            SensorVariant::Optical => &["lux"],
        }
    }
}

impl fmt::Display for SensorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorVariant {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accelerometer" | "accel" | "acc" => Ok(SensorVariant::Accelerometer),
            "gyroscope" | "gyro" => Ok(SensorVariant::Gyroscope),
            "magnetometer" | "mag" => Ok(SensorVariant::Magnetometer),
            "quaternion" | "quat" => Ok(SensorVariant::Quaternion),
            "humidity" => Ok(SensorVariant::Humidity),
            "barometer" | "pressure" => Ok(SensorVariant::Barometer),
            "optical" | "light" | "lux" => Ok(SensorVariant::Optical),
            _ => Err(ParseNameError::UnknownSensor(s.to_string())),
        }
    }
}

/// A decoded value set in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Measurement {
    /// Three-axis vector (accelerometer, gyroscope or magnetometer).
    Vector {
        /// X axis.
        x: f64,
        /// Y axis.
        y: f64,
        /// Z axis.
        z: f64,
    },
    /// Orientation quaternion (unitless).
    Quaternion {
        /// Scalar part.
        q0: f64,
        /// First vector component.
        q1: f64,
        /// Second vector component.
        q2: f64,
        /// Third vector component.
        q3: f64,
    },
    /// Humidity sensor output.
    Humidity {
        /// Temperature in °C.
        temperature: f64,
        /// Relative humidity in percent.
        humidity: f64,
    },
    /// Barometer output.
    Barometer {
        /// Temperature in °C.
        temperature: f64,
        /// Pressure in millibar.
        pressure: f64,
    },
    /// Ambient light.
    Light {
        /// Illuminance in lux.
        lux: f64,
    },
}

impl Measurement {
    /// Values in the same order as [`SensorVariant::field_names`].
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        match *self {
            Measurement::Vector { x, y, z } => vec![x, y, z],
            Measurement::Quaternion { q0, q1, q2, q3 } => vec![q0, q1, q2, q3],
            Measurement::Humidity {
                temperature,
                humidity,
            } => vec![temperature, humidity],
            Measurement::Barometer {
                temperature,
                pressure,
            } => vec![temperature, pressure],
            Measurement::Light { lux } => vec![lux],
        }
    }
}

/// One decoded sample for one variant of one device.
///
/// Immutable once created; the next reading for the same variant replaces it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Wall-clock time at which the notification was decoded.
    pub timestamp: time::OffsetDateTime,
    /// Which sensor produced the values.
    pub variant: SensorVariant,
    /// The decoded values.
    pub measurement: Measurement,
}

impl Reading {
    /// Create a reading stamped with the given time.
    pub fn new(
        variant: SensorVariant,
        measurement: Measurement,
        timestamp: time::OffsetDateTime,
    ) -> Self {
        Self {
            timestamp,
            variant,
            measurement,
        }
    }

    /// Pairs of (field name, value).
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.variant
            .field_names()
            .iter()
            .copied()
            .zip(self.measurement.values())
    }
}

/// Code written to the IO data characteristic to drive the LEDs and buzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum IndicatorCode {
    /// Everything off.
    #[default]
    Off = 0,
    /// Red LED.
    Red = 1,
    /// Green LED.
    Green = 2,
    /// Red and green LEDs.
    RedGreen = 3,
    /// Buzzer only.
    Buzzer = 4,
    /// Red LED and buzzer.
    RedBuzzer = 5,
    /// Green LED and buzzer.
    GreenBuzzer = 6,
    /// Both LEDs and the buzzer.
    All = 7,
}

impl IndicatorCode {
    /// The byte written to the IO data characteristic.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for IndicatorCode {
    type Error = ParseNameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IndicatorCode::Off),
            1 => Ok(IndicatorCode::Red),
            2 => Ok(IndicatorCode::Green),
            3 => Ok(IndicatorCode::RedGreen),
            4 => Ok(IndicatorCode::Buzzer),
            5 => Ok(IndicatorCode::RedBuzzer),
            6 => Ok(IndicatorCode::GreenBuzzer),
            7 => Ok(IndicatorCode::All),
            _ => Err(ParseNameError::InvalidIndicator(value)),
        }
    }
}
