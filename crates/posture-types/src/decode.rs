//! Telemetry decoders: raw notification payload to physical units.
//!
//! All functions here are pure. Each payload format has an exact size and a
//! payload of any other size is rejected with [`DecodeError::BadLength`].
//!
//! | Variant | Bytes | Layout |
//! |---------|-------|--------|
//! | Gyroscope / Accelerometer / Magnetometer | 18 | 9 x i16 LE `[gx,gy,gz,ax,ay,az,mx,my,mz]` |
//! | Quaternion | 18 | 4 x f32 LE + u16 sequence counter (ignored) |
//! | Humidity | 4 | 2 x u16 LE `[rawT, rawH]` |
//! | Barometer | 6 | 6 x u8 `[tL,tM,tH,pL,pM,pH]` |
//! | Optical | 2 | 1 x i16 LE, 12-bit mantissa + 4-bit exponent |

use bytes::Buf;

use crate::error::{DecodeError, DecodeResult};
use crate::types::{Measurement, Reading, SensorVariant};

/// Size of the 9-axis movement payload.
pub const MOTION_PAYLOAD_LEN: usize = 18;
/// Size of the quaternion payload, including the trailing sequence counter.
pub const QUATERNION_PAYLOAD_LEN: usize = 18;
/// Size of the humidity payload.
pub const HUMIDITY_PAYLOAD_LEN: usize = 4;
/// Size of the barometer payload.
pub const BAROMETER_PAYLOAD_LEN: usize = 6;
/// Size of the optical payload.
pub const OPTICAL_PAYLOAD_LEN: usize = 2;

/// Gyroscope scale: ±250 deg/s over the full i16 range.
pub const GYRO_SCALE: f64 = 500.0 / 65536.0;
/// Accelerometer scale with the range register set to ±4 g.
pub const ACCEL_SCALE: f64 = 8.0 / 32768.0;
/// Magnetometer scale (MPU-9250 register map v1.4).
pub const MAG_SCALE: f64 = 4912.0 / 32760.0;

/// Decode a payload for one variant into physical units.
///
/// # Examples
///
/// ```
/// use posture_types::{Measurement, SensorVariant, decode};
///
/// // 0x1064: mantissa 100, exponent 1 -> 0.01 * (100 << 1) lux
/// let lux = decode::decode(SensorVariant::Optical, &[0x64, 0x10]).unwrap();
/// assert_eq!(lux, Measurement::Light { lux: 2.0 });
/// ```
///
/// # Errors
///
/// Returns [`DecodeError::BadLength`] if `payload` is not exactly
/// [`SensorVariant::payload_len`] bytes.
pub fn decode(variant: SensorVariant, payload: &[u8]) -> DecodeResult<Measurement> {
    check_len(variant, payload)?;

    let measurement = match variant {
        SensorVariant::Gyroscope => {
            let raw = motion_raw(payload);
            scaled_vector(&raw[0..3], GYRO_SCALE)
        }
        SensorVariant::Accelerometer => {
            let raw = motion_raw(payload);
            scaled_vector(&raw[3..6], ACCEL_SCALE)
        }
        SensorVariant::Magnetometer => {
            let raw = motion_raw(payload);
            scaled_vector(&raw[6..9], MAG_SCALE)
        }
        SensorVariant::Quaternion => quaternion(payload),
        SensorVariant::Humidity => humidity(payload),
        SensorVariant::Barometer => barometer(payload),
        SensorVariant::Optical => optical(payload),
    };

    Ok(measurement)
}

/// Decode a payload and stamp it with `timestamp`.
///
/// # Errors
///
/// Same as [`decode`].
pub fn decode_reading(
    variant: SensorVariant,
    payload: &[u8],
    timestamp: time::OffsetDateTime,
) -> DecodeResult<Reading> {
    decode(variant, payload).map(|m| Reading::new(variant, m, timestamp))
}

/// Split a 9-axis movement payload into its raw signed integers.
///
/// # Errors
///
/// Returns [`DecodeError::BadLength`] unless the payload is 18 bytes.
pub fn decode_motion_raw(payload: &[u8]) -> DecodeResult<[i16; 9]> {
    check_len(SensorVariant::Gyroscope, payload)?;
    Ok(motion_raw(payload))
}

fn check_len(variant: SensorVariant, payload: &[u8]) -> DecodeResult<()> {
    let expected = variant.payload_len();
    if payload.len() != expected {
        return Err(DecodeError::BadLength {
            variant,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn motion_raw(payload: &[u8]) -> [i16; 9] {
    let mut buf = payload;
    let mut raw = [0i16; 9];
    for value in &mut raw {
        *value = buf.get_i16_le();
    }
    raw
}

fn scaled_vector(raw: &[i16], scale: f64) -> Measurement {
    Measurement::Vector {
        x: f64::from(raw[0]) * scale,
        y: f64::from(raw[1]) * scale,
        z: f64::from(raw[2]) * scale,
    }
}

fn quaternion(payload: &[u8]) -> Measurement {
    let mut buf = &payload[..16];
    Measurement::Quaternion {
        q0: f64::from(buf.get_f32_le()),
        q1: f64::from(buf.get_f32_le()),
        q2: f64::from(buf.get_f32_le()),
        q3: f64::from(buf.get_f32_le()),
    }
}

fn humidity(payload: &[u8]) -> Measurement {
    let mut buf = payload;
    let raw_t = f64::from(buf.get_u16_le());
    let raw_h = f64::from(buf.get_u16_le());
    Measurement::Humidity {
        temperature: -40.0 + 165.0 * (raw_t / 65536.0),
        humidity: 100.0 * (raw_h / 65536.0),
    }
}

fn barometer(payload: &[u8]) -> Measurement {
    let combine = |lo: u8, mid: u8, hi: u8| -> f64 {
        f64::from(u32::from(hi) * 65536 + u32::from(mid) * 256 + u32::from(lo)) / 100.0
    };
    Measurement::Barometer {
        temperature: combine(payload[0], payload[1], payload[2]),
        pressure: combine(payload[3], payload[4], payload[5]),
    }
}

fn optical(payload: &[u8]) -> Measurement {
    let mut buf = payload;
    // Only the bit pattern matters: mantissa and exponent are unsigned fields.
    let raw = buf.get_u16_le();
    let mantissa = u32::from(raw & 0x0FFF);
    let exponent = u32::from((raw & 0xF000) >> 12);
    Measurement::Light {
        lux: 0.01 * f64::from(mantissa << exponent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn motion_payload(raw: [i16; 9]) -> Vec<u8> {
        raw.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn vector(m: Measurement) -> (f64, f64, f64) {
        match m {
            Measurement::Vector { x, y, z } => (x, y, z),
            other => panic!("expected vector, got {:?}", other),
        }
    }

    #[test]
    fn test_accelerometer_full_scale_is_four_g() {
        let payload = motion_payload([0, 0, 0, 16384, -16384, 0, 0, 0, 0]);
        let (x, y, z) = vector(decode(SensorVariant::Accelerometer, &payload).unwrap());
        assert!((x - 4.0).abs() < EPS);
        assert!((y + 4.0).abs() < EPS);
        assert!(z.abs() < EPS);
    }

    #[test]
    fn test_gyroscope_scale() {
        let payload = motion_payload([65, -131, 32767, 0, 0, 0, 0, 0, 0]);
        let (x, y, z) = vector(decode(SensorVariant::Gyroscope, &payload).unwrap());
        assert!((x - 65.0 * 500.0 / 65536.0).abs() < EPS);
        assert!((y + 131.0 * 500.0 / 65536.0).abs() < EPS);
        assert!((z - 32767.0 * 500.0 / 65536.0).abs() < EPS);
    }

    #[test]
    fn test_magnetometer_scale() {
        let payload = motion_payload([0, 0, 0, 0, 0, 0, 32760, 0, -32760]);
        let (x, y, z) = vector(decode(SensorVariant::Magnetometer, &payload).unwrap());
        assert!((x - 4912.0).abs() < EPS);
        assert!(y.abs() < EPS);
        assert!((z + 4912.0).abs() < EPS);
    }

    #[test]
    fn test_quaternion_ignores_sequence_counter() {
        let mut payload = Vec::new();
        for q in [1.0f32, 0.25, -0.5, 0.125] {
            payload.extend_from_slice(&q.to_le_bytes());
        }
        payload.extend_from_slice(&[0xAB, 0xCD]);

        let m = decode(SensorVariant::Quaternion, &payload).unwrap();
        assert_eq!(
            m,
            Measurement::Quaternion { q0: 1.0, q1: 0.25, q2: -0.5, q3: 0.125 }
        );
    }

    #[test]
    fn test_quaternion_without_counter_is_rejected() {
        let payload = [0u8; 16];
        assert_eq!(
            decode(SensorVariant::Quaternion, &payload),
            Err(DecodeError::BadLength {
                variant: SensorVariant::Quaternion,
                expected: 18,
                actual: 16,
            })
        );
    }

    #[test]
    fn test_humidity_midpoint() {
        let payload = [0x00, 0x80, 0x00, 0x80];
        match decode(SensorVariant::Humidity, &payload).unwrap() {
            Measurement::Humidity { temperature, humidity } => {
                assert!((temperature - 42.5).abs() < EPS);
                assert!((humidity - 50.0).abs() < EPS);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_barometer_combines_little_endian_bytes() {
        let payload = [0x00, 0x27, 0x00, 0x00, 0xC3, 0x00];
        match decode(SensorVariant::Barometer, &payload).unwrap() {
            Measurement::Barometer { temperature, pressure } => {
                assert!((temperature - 99.84).abs() < EPS);
                assert!((pressure - 499.20).abs() < EPS);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_barometer_high_byte() {
        // 0x018A92 = 101010 -> 1010.10 mbar
        let payload = [0xC4, 0x09, 0x00, 0x92, 0x8A, 0x01];
        match decode(SensorVariant::Barometer, &payload).unwrap() {
            Measurement::Barometer { temperature, pressure } => {
                assert!((temperature - 25.0).abs() < EPS);
                assert!((pressure - 1010.10).abs() < EPS);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_optical_mantissa_and_exponent() {
        let m = decode(SensorVariant::Optical, &0x1064u16.to_le_bytes()).unwrap();
        assert_eq!(m, Measurement::Light { lux: 2.0 });
    }

    #[test]
    fn test_optical_top_nibble_is_unsigned_exponent() {
        // 0xF001 is negative as i16 but encodes mantissa 1, exponent 15.
        let m = decode(SensorVariant::Optical, &0xF001u16.to_le_bytes()).unwrap();
        match m {
            Measurement::Light { lux } => assert!((lux - 0.01 * 32768.0).abs() < EPS),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_length_for_every_variant() {
        for variant in SensorVariant::ALL {
            let payload = vec![0u8; variant.payload_len() + 1];
            let err = decode(variant, &payload).unwrap_err();
            assert_eq!(
                err,
                DecodeError::BadLength {
                    variant,
                    expected: variant.payload_len(),
                    actual: variant.payload_len() + 1,
                }
            );
            assert!(decode(variant, &[]).is_err());
        }
    }

    #[test]
    fn test_decode_reading_keeps_timestamp() {
        let ts = time::OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(42);
        let reading = decode_reading(SensorVariant::Optical, &[0x64, 0x10], ts).unwrap();
        assert_eq!(reading.timestamp, ts);
        assert_eq!(reading.variant, SensorVariant::Optical);
    }

    proptest! {
        #[test]
        fn prop_motion_slices_partition_payload(raw in proptest::array::uniform9(any::<i16>())) {
            let payload = motion_payload(raw);
            prop_assert_eq!(decode_motion_raw(&payload).unwrap(), raw);

            let (gx, gy, gz) = vector(decode(SensorVariant::Gyroscope, &payload).unwrap());
            let (ax, ay, az) = vector(decode(SensorVariant::Accelerometer, &payload).unwrap());
            let (mx, my, mz) = vector(decode(SensorVariant::Magnetometer, &payload).unwrap());

            // Undo each scale and recover exactly the nine inputs, in order.
            let recovered = [
                gx / GYRO_SCALE, gy / GYRO_SCALE, gz / GYRO_SCALE,
                ax / ACCEL_SCALE, ay / ACCEL_SCALE, az / ACCEL_SCALE,
                mx / MAG_SCALE, my / MAG_SCALE, mz / MAG_SCALE,
            ];
            for (value, expected) in recovered.iter().zip(raw.iter()) {
                prop_assert!((value - f64::from(*expected)).abs() < 1e-6);
            }
        }

        #[test]
        fn prop_humidity_stays_in_range(raw_t in any::<u16>(), raw_h in any::<u16>()) {
            let mut payload = raw_t.to_le_bytes().to_vec();
            payload.extend_from_slice(&raw_h.to_le_bytes());
            match decode(SensorVariant::Humidity, &payload).unwrap() {
                Measurement::Humidity { temperature, humidity } => {
                    prop_assert!((-40.0..125.0).contains(&temperature));
                    prop_assert!((0.0..100.0).contains(&humidity));
                }
                _ => prop_assert!(false),
            }
        }
    }
}
