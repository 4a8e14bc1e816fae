//! LUT scaling and binary encoding.

use super::fit::Quadratic;
use crc::{Crc, CRC_32_ISO_HDLC};

/// Number of entries in a correction LUT, one per 8-bit commanded level.
pub const LUT_ENTRIES: usize = 256;

/// Full-scale 16-bit analog drive value.
pub const MAX_ANALOG: f64 = 65_535.0;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A scaled 256-entry drive table plus its audit flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaledLut {
    pub entries: Vec<u16>,
    /// A non-identity curve was applied.
    pub power_scaled: bool,
    /// The clamp ceiling was hit before the controllable-power floor.
    pub power_called_failure: bool,
}

/// Scale a fitted curve into a clamped 16-bit drive table.
///
/// Each of the 256 evenly spaced input fractions is pushed through the
/// curve, multiplied up to the analog full scale, rounded, and clamped to
/// `[0, floor(MAX_ANALOG * power_modified_limit)]`. `PowerCalledFailure` is
/// raised when the ceiling is first reached at an index strictly below
/// `round(power_called_limit * 255)`: the curve saturates before the part
/// of the commanded range that must stay controllable.
pub fn scale_curve(
    curve: &Quadratic,
    power_modified_limit: f64,
    power_called_limit: f64,
) -> ScaledLut {
    let ceiling = (MAX_ANALOG * power_modified_limit).floor();
    let called_floor = (power_called_limit * 255.0).round() as usize;

    let mut entries = Vec::with_capacity(LUT_ENTRIES);
    let mut first_ceiling_index: Option<usize> = None;
    for i in 0..LUT_ENTRIES {
        let x = i as f64 / 255.0;
        let raw = (curve.eval(x) * MAX_ANALOG).round();
        let clamped = raw.clamp(0.0, ceiling);
        if clamped >= ceiling && first_ceiling_index.is_none() {
            first_ceiling_index = Some(i);
        }
        entries.push(clamped as u16);
    }

    ScaledLut {
        entries,
        power_scaled: curve.b != 1.0,
        power_called_failure: first_ceiling_index.is_some_and(|i| i < called_floor),
    }
}

/// The safe-default table: an unclamped linear ramp from the identity curve.
pub fn linear_lut() -> ScaledLut {
    scale_curve(&Quadratic::IDENTITY, 1.0, 0.6)
}

/// Encode a scaled table as the firmware blob: 256 little-endian u16
/// samples followed by the little-endian CRC32 of those 512 bytes.
pub fn encode_blob(lut: &ScaledLut) -> Vec<u8> {
    let mut blob = Vec::with_capacity(LUT_ENTRIES * 2 + 4);
    for entry in &lut.entries {
        blob.extend_from_slice(&entry.to_le_bytes());
    }
    let checksum = CRC32.checksum(&blob);
    blob.extend_from_slice(&checksum.to_le_bytes());
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_curve_is_a_clamped_ramp() {
        let lut = linear_lut();
        assert_eq!(lut.entries.len(), LUT_ENTRIES);
        assert_eq!(lut.entries[0], 0);
        assert_eq!(lut.entries[255], 65_535);
        assert!(!lut.power_scaled);
        assert!(!lut.power_called_failure);
        // Monotone non-decreasing.
        assert!(lut.entries.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn entries_respect_the_modified_limit() {
        let lut = scale_curve(&Quadratic::IDENTITY, 0.5, 0.6);
        let ceiling = (MAX_ANALOG * 0.5).floor() as u16;
        assert!(lut.entries.iter().all(|&e| e <= ceiling));
        // Identity hits the half-scale ceiling at index 128, below
        // round(0.6 * 255) = 153.
        assert!(lut.power_called_failure);
    }

    #[test]
    fn saturation_past_the_called_floor_is_not_a_failure() {
        // A curve that only saturates near the top of the range.
        let curve = Quadratic {
            a: 0.0,
            b: 1.05,
            c: 0.0,
        };
        let lut = scale_curve(&curve, 1.0, 0.6);
        assert!(lut.power_scaled);
        assert!(!lut.power_called_failure);
    }

    #[test]
    fn blob_carries_a_trailing_le_crc32() {
        let blob = encode_blob(&linear_lut());
        assert_eq!(blob.len(), 516);
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&blob[..512]);
        assert_eq!(blob[512..516], crc.to_le_bytes());
    }

    #[test]
    fn crc32_of_empty_input_is_zero() {
        assert_eq!(Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&[]), 0);
    }
}
