//! Fixed-point PCM to floating-point sample conversion.
//!
//! The engine renders 16-bit little-endian signed samples into engine-managed
//! memory; the audio callback normalizes them into the host's [-1.0, 1.0]
//! float range. The scaling and byte order here are load-bearing: samples are
//! divided by the maximum positive 16-bit magnitude (32767), so the most
//! negative input maps slightly below -1.0 (≈ -1.00003).

/// Maximum positive magnitude of a signed 16-bit sample.
pub const I16_SCALE: f32 = 32767.0;

/// Reads a little-endian signed 16-bit value at the given byte offset.
///
/// Returns `None` when the offset (plus one) falls outside the buffer.
pub fn read_i16_le(buf: &[u8], byte_offset: usize) -> Option<i16> {
    let high = buf.get(byte_offset + 1)?;
    let low = buf.get(byte_offset)?;
    Some(i16::from_le_bytes([*low, *high]))
}

/// Normalizes a signed 16-bit sample to a float in ≈ [-1.0007, 1.0].
pub fn normalize(sample: i16) -> f32 {
    sample as f32 / I16_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scaling() {
        assert_eq!(normalize(0), 0.0);
        assert_eq!(normalize(32767), 1.0);
        assert_eq!(normalize(-32767), -1.0);

        // The most negative sample exceeds -1.0 by one quantum
        let floor = normalize(-32768);
        assert!(floor < -1.0);
        assert!(floor > -1.001);
    }

    #[test]
    fn test_normalize_matches_division_across_range() {
        // Spot checks plus the full boundary sweep near zero
        for s in [-32768i16, -32767, -1, 0, 1, 12345, 32766, 32767] {
            assert_eq!(normalize(s), s as f32 / 32767.0);
        }
        for s in -64i16..=64 {
            assert_eq!(normalize(s), s as f32 / 32767.0);
        }
    }

    #[test]
    fn test_read_i16_le_byte_order() {
        // 0x0201 little-endian
        let buf = [0x01, 0x02, 0xFF, 0xFF];
        assert_eq!(read_i16_le(&buf, 0), Some(0x0201));
        assert_eq!(read_i16_le(&buf, 2), Some(-1));
    }

    #[test]
    fn test_read_i16_le_bounds() {
        let buf = [0x00, 0x01, 0x02];
        // Offset 2 would need byte 3
        assert_eq!(read_i16_le(&buf, 2), None);
        assert_eq!(read_i16_le(&buf, 3), None);
        assert_eq!(read_i16_le(&[], 0), None);
    }
}
