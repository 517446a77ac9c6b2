//! Per-device sensor selection.
//!
//! A [`SensorSet`] is the validated set of [`SensorVariant`]s one device
//! enables. It knows which control writes bring those sensors up and which
//! data characteristics must be subscribed.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::error::SensorSetError;
use crate::types::{ControlValue, SensorVariant};
use crate::uuid::SENSOR_ENABLE;

/// One write to a control characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlWrite {
    /// Control characteristic UUID.
    pub characteristic: Uuid,
    /// Bytes to write.
    pub value: Vec<u8>,
}

/// Validated, non-empty set of sensor variants for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSet {
    variants: BTreeSet<SensorVariant>,
}

impl SensorSet {
    /// Build a set, rejecting empty selections and firmware conflicts.
    ///
    /// Barometer and quaternion live on the same characteristic pair and are
    /// mutually exclusive.
    ///
    /// # Errors
    ///
    /// Returns [`SensorSetError::Empty`] or [`SensorSetError::Conflict`].
    pub fn new(variants: impl IntoIterator<Item = SensorVariant>) -> Result<Self, SensorSetError> {
        let variants: BTreeSet<_> = variants.into_iter().collect();
        if variants.is_empty() {
            return Err(SensorSetError::Empty);
        }
        if variants.contains(&SensorVariant::Quaternion)
            && variants.contains(&SensorVariant::Barometer)
        {
            return Err(SensorSetError::Conflict {
                first: SensorVariant::Quaternion,
                second: SensorVariant::Barometer,
            });
        }
        Ok(Self { variants })
    }

    /// Iterate over the variants in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = SensorVariant> + '_ {
        self.variants.iter().copied()
    }

    /// Number of enabled variants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    /// Always false for a constructed set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Whether `variant` is enabled.
    #[must_use]
    pub fn contains(&self, variant: SensorVariant) -> bool {
        self.variants.contains(&variant)
    }

    /// The writes that enable every sensor in the set.
    ///
    /// Variants sharing a control characteristic are merged: bitmasks are
    /// OR'ed into a single 16-bit little-endian value. One write per
    /// characteristic.
    ///
    /// ```
    /// use posture_types::{SensorSet, ble};
    ///
    /// let writes = SensorSet::default().control_writes();
    /// assert_eq!(writes.len(), 1);
    /// assert_eq!(writes[0].characteristic, ble::MOTION_CONFIG);
    /// assert_eq!(writes[0].value, vec![0x7F, 0x01]);
    /// ```
    #[must_use]
    pub fn control_writes(&self) -> Vec<ControlWrite> {
        let mut writes: Vec<(Uuid, Option<u16>)> = Vec::new();

        for variant in self.iter() {
            let characteristic = variant.control_characteristic();
            let mask = match variant.control_value() {
                ControlValue::Bitmask(bits) => Some(bits),
                ControlValue::Enable => None,
            };

            match writes.iter_mut().find(|(c, _)| *c == characteristic) {
                Some((_, existing)) => {
                    if let (Some(acc), Some(bits)) = (existing.as_mut(), mask) {
                        *acc |= bits;
                    }
                }
                None => writes.push((characteristic, mask)),
            }
        }

        writes
            .into_iter()
            .map(|(characteristic, mask)| ControlWrite {
                characteristic,
                value: match mask {
                    Some(bits) => bits.to_le_bytes().to_vec(),
                    None => vec![SENSOR_ENABLE],
                },
            })
            .collect()
    }

    /// Data characteristics to subscribe, deduplicated.
    #[must_use]
    pub fn data_characteristics(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = Vec::new();
        for variant in self.iter() {
            let uuid = variant.data_characteristic();
            if !uuids.contains(&uuid) {
                uuids.push(uuid);
            }
        }
        uuids
    }

    /// Variants in this set fed by notifications on `characteristic`.
    ///
    /// A single motion notification yields one reading per enabled motion
    /// variant.
    #[must_use]
    pub fn variants_for(&self, characteristic: Uuid) -> Vec<SensorVariant> {
        self.iter()
            .filter(|v| v.data_characteristic() == characteristic)
            .collect()
    }

    /// Output field names for every variant, in canonical order.
    #[must_use]
    pub fn field_names(&self) -> Vec<&'static str> {
        self.iter()
            .flat_map(|v| v.field_names().iter().copied())
            .collect()
    }
}

impl Default for SensorSet {
    /// Accelerometer, gyroscope and magnetometer.
    fn default() -> Self {
        Self {
            variants: [
                SensorVariant::Accelerometer,
                SensorVariant::Gyroscope,
                SensorVariant::Magnetometer,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SensorSet {
    type Item = SensorVariant;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, SensorVariant>>;

    fn into_iter(self) -> Self::IntoIter {
        self.variants.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid as ble;

    #[test]
    fn test_empty_set_rejected() {
        assert_eq!(SensorSet::new([]), Err(SensorSetError::Empty));
    }

    #[test]
    fn test_quaternion_and_barometer_conflict() {
        let err = SensorSet::new([SensorVariant::Barometer, SensorVariant::Quaternion]).unwrap_err();
        assert!(matches!(err, SensorSetError::Conflict { .. }));
    }

    #[test]
    fn test_motion_trio_merges_into_one_write() {
        let writes = SensorSet::default().control_writes();
        assert_eq!(
            writes,
            vec![ControlWrite {
                characteristic: ble::MOTION_CONFIG,
                value: 0x017Fu16.to_le_bytes().to_vec(),
            }]
        );
    }

    #[test]
    fn test_single_motion_variant_bitmask() {
        let set = SensorSet::new([SensorVariant::Gyroscope]).unwrap();
        assert_eq!(set.control_writes()[0].value, vec![0x07, 0x00]);

        let set = SensorSet::new([SensorVariant::Accelerometer]).unwrap();
        assert_eq!(set.control_writes()[0].value, vec![0x38, 0x01]);
    }

    #[test]
    fn test_enable_byte_sensors() {
        let set = SensorSet::new([SensorVariant::Humidity, SensorVariant::Optical]).unwrap();
        let writes = set.control_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&ControlWrite {
            characteristic: ble::HUMIDITY_CONFIG,
            value: vec![0x01],
        }));
        assert!(writes.contains(&ControlWrite {
            characteristic: ble::OPTICAL_CONFIG,
            value: vec![0x01],
        }));
    }

    #[test]
    fn test_mixed_set() {
        let set = SensorSet::new([
            SensorVariant::Accelerometer,
            SensorVariant::Quaternion,
            SensorVariant::Optical,
        ])
        .unwrap();
        let writes = set.control_writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(set.data_characteristics().len(), 3);
        assert_eq!(
            set.variants_for(ble::QUATERNION_DATA),
            vec![SensorVariant::Quaternion]
        );
        assert!(set.variants_for(ble::HUMIDITY_DATA).is_empty());
    }

    #[test]
    fn test_motion_notification_fans_out() {
        let set = SensorSet::default();
        assert_eq!(set.data_characteristics(), vec![ble::MOTION_DATA]);
        assert_eq!(
            set.variants_for(ble::MOTION_DATA),
            vec![
                SensorVariant::Accelerometer,
                SensorVariant::Gyroscope,
                SensorVariant::Magnetometer,
            ]
        );
    }

    #[test]
    fn test_field_names() {
        let set = SensorSet::new([SensorVariant::Optical, SensorVariant::Accelerometer]).unwrap();
        assert_eq!(set.field_names(), vec!["acc_x", "acc_y", "acc_z", "lux"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let set = SensorSet::new([SensorVariant::Optical, SensorVariant::Optical]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(SensorVariant::Optical));
        assert!(!set.is_empty());
    }
}
