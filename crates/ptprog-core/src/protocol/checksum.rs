//! Frame checksum
//!
//! The checksum is `0xFF` minus the low byte of the sum of every byte from the
//! frame type through the last data byte. A receiver validates a frame by
//! adding the checksum back in: the low byte of the total must be `0xFF`.

use super::ProtocolError;

/// Offset of the frame type byte, the first byte covered by the checksum
pub const CHECKSUM_START: usize = 3;

/// Compute the checksum over `bytes[from..=to]`
///
/// The span is clamped to the slice: bytes past the end contribute nothing,
/// and an empty span yields `0xFF`.
pub fn compute(bytes: &[u8], from: usize, to: usize) -> u8 {
    let sum = bytes
        .iter()
        .take(to.saturating_add(1))
        .skip(from)
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFF - sum
}

/// Check the trailing checksum byte of an unescaped frame
pub fn validate(frame: &[u8]) -> bool {
    verify(frame).is_ok()
}

/// Like [`validate`], but reports what was expected
pub fn verify(frame: &[u8]) -> Result<(), ProtocolError> {
    // Delimiter, two length bytes, type, checksum
    if frame.len() < CHECKSUM_START + 2 {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} bytes is too short to carry a checksum",
            frame.len()
        )));
    }

    let last = frame.len() - 1;
    let expected = compute(frame, CHECKSUM_START, last - 1);
    let actual = frame[last];
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_clamps_span_to_slice() {
        let bytes = [0x7E, 0x00, 0x02, 0x10, 0x20];
        assert_eq!(compute(&bytes, 3, 4), 0xFF - 0x30);
        assert_eq!(compute(&bytes, 3, 100), 0xFF - 0x30);
        assert_eq!(compute(&bytes, 10, 20), 0xFF);
        assert_eq!(compute(&bytes, 4, 3), 0xFF);
        assert_eq!(compute(&[], 0, usize::MAX), 0xFF);
    }

    const DISCOVERY: [u8; 8] = [0x7E, 0x00, 0x04, 0x08, 0x01, 0x4E, 0x44, 0x64];

    #[test]
    fn test_compute_discovery_checksum() {
        assert_eq!(compute(&DISCOVERY, 3, 6), 0x64);
    }

    #[test]
    fn test_compute_wraps_sum() {
        // 0xFF + 0xFF + 0x02 = 0x200, low byte 0x00
        assert_eq!(compute(&[0xFF, 0xFF, 0x02], 0, 2), 0xFF);
    }

    #[test]
    fn test_validate() {
        assert!(validate(&DISCOVERY));

        let mut corrupted = DISCOVERY;
        corrupted[5] ^= 0x01;
        assert!(!validate(&corrupted));
    }

    #[test]
    fn test_verify_reports_both_values() {
        let mut frame = DISCOVERY;
        frame[7] = 0x10;
        match verify(&frame) {
            Err(ProtocolError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, 0x64);
                assert_eq!(actual, 0x10);
            }
            other => panic!("Expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_short_frame() {
        assert!(matches!(
            verify(&[0x7E, 0x00, 0x00]),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }
}
