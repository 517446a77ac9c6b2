//! Bluetooth UUIDs for the SensorTag GATT services used by the posture rig.
//!
//! Every TI SensorTag service exposes a data characteristic (notify) and a
//! control characteristic (write). All of them share the vendor base
//! `f000xxxx-0451-4000-b000-000000000000`.

use uuid::{Uuid, uuid};

// --- Movement (MPU-9250) ---

/// 9-axis movement data: gyro, accelerometer and magnetometer, 9 x i16 LE.
pub const MOTION_DATA: Uuid = uuid!("f000aa81-0451-4000-b000-000000000000");

/// 9-axis movement control register (u16 LE enable bitmask).
pub const MOTION_CONFIG: Uuid = uuid!("f000aa82-0451-4000-b000-000000000000");

// --- Quaternion / Barometer (shared pair, firmware dependent) ---

/// Quaternion data in quaternion firmware, barometer data otherwise.
pub const QUATERNION_DATA: Uuid = uuid!("f000aa41-0451-4000-b000-000000000000");

/// Control register paired with [`QUATERNION_DATA`].
pub const QUATERNION_CONFIG: Uuid = uuid!("f000aa42-0451-4000-b000-000000000000");

/// Barometer data. Same characteristic as [`QUATERNION_DATA`].
pub const BAROMETER_DATA: Uuid = QUATERNION_DATA;

/// Barometer control. Same characteristic as [`QUATERNION_CONFIG`].
pub const BAROMETER_CONFIG: Uuid = QUATERNION_CONFIG;

// --- Environment sensors ---

/// Humidity data: raw temperature and raw humidity, 2 x u16 LE.
pub const HUMIDITY_DATA: Uuid = uuid!("f000aa21-0451-4000-b000-000000000000");

/// Humidity control register.
pub const HUMIDITY_CONFIG: Uuid = uuid!("f000aa22-0451-4000-b000-000000000000");

/// Optical (lux) data: one i16 LE with a 4-bit exponent.
pub const OPTICAL_DATA: Uuid = uuid!("f000aa71-0451-4000-b000-000000000000");

/// Optical control register.
pub const OPTICAL_CONFIG: Uuid = uuid!("f000aa72-0451-4000-b000-000000000000");

// --- IO service (LEDs and buzzer) ---

/// IO data: the indicator code to drive.
pub const IO_DATA: Uuid = uuid!("f000aa65-0451-4000-b000-000000000000");

/// IO config: write `0x01` to hand the outputs to the remote client.
pub const IO_CONFIG: Uuid = uuid!("f000aa66-0451-4000-b000-000000000000");

/// Value written to a single-byte control register to enable a sensor.
pub const SENSOR_ENABLE: u8 = 0x01;

/// Value written to [`IO_CONFIG`] to arm remote control of the indicator.
pub const IO_REMOTE_MODE: u8 = 0x01;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_uuids() {
        assert_eq!(
            MOTION_DATA.to_string(),
            "f000aa81-0451-4000-b000-000000000000"
        );
        assert_eq!(
            MOTION_CONFIG.to_string(),
            "f000aa82-0451-4000-b000-000000000000"
        );
    }

    #[test]
    fn test_barometer_shares_quaternion_pair() {
        assert_eq!(BAROMETER_DATA, QUATERNION_DATA);
        assert_eq!(BAROMETER_CONFIG, QUATERNION_CONFIG);
        assert_eq!(
            QUATERNION_DATA.to_string(),
            "f000aa41-0451-4000-b000-000000000000"
        );
    }

    #[test]
    fn test_environment_uuids() {
        assert_eq!(
            HUMIDITY_DATA.to_string(),
            "f000aa21-0451-4000-b000-000000000000"
        );
        assert_eq!(
            HUMIDITY_CONFIG.to_string(),
            "f000aa22-0451-4000-b000-000000000000"
        );
        assert_eq!(
            OPTICAL_DATA.to_string(),
            "f000aa71-0451-4000-b000-000000000000"
        );
        assert_eq!(
            OPTICAL_CONFIG.to_string(),
            "f000aa72-0451-4000-b000-000000000000"
        );
    }

    #[test]
    fn test_io_uuids() {
        assert_eq!(IO_DATA.to_string(), "f000aa65-0451-4000-b000-000000000000");
        assert_eq!(
            IO_CONFIG.to_string(),
            "f000aa66-0451-4000-b000-000000000000"
        );
    }

    #[test]
    fn test_all_uuids_share_vendor_base() {
        let all = [
            MOTION_DATA,
            MOTION_CONFIG,
            QUATERNION_DATA,
            QUATERNION_CONFIG,
            HUMIDITY_DATA,
            HUMIDITY_CONFIG,
            OPTICAL_DATA,
            OPTICAL_CONFIG,
            IO_DATA,
            IO_CONFIG,
        ];
        for uuid in all {
            let s = uuid.to_string();
            assert!(s.starts_with("f000aa"), "{s}");
            assert!(s.ends_with("-0451-4000-b000-000000000000"), "{s}");
        }
    }
}
