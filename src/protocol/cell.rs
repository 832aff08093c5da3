//! Cell padding
//!
//! Every payload travels as a cell: a buffer whose length is a multiple of
//! [`CELL_SIZE`]. Padding appends a single `0x80` marker byte followed by
//! zeros up to the next boundary (ISO/IEC 7816-4 style), so the true length
//! is always recoverable. A payload that already fills whole cells still
//! grows by one cell, since the marker needs a byte.

use crate::error::{OnionError, Result};

/// Padding granularity in bytes
pub const CELL_SIZE: usize = 512;

/// Byte that terminates the payload inside a padded cell
pub const PADDING_MARKER: u8 = 0x80;

/// Length of `pad(payload)` for a payload of `payload_len` bytes
///
/// Smallest multiple of `CELL_SIZE` that is >= `payload_len + 1`.
pub fn padded_len(payload_len: usize) -> usize {
    (payload_len / CELL_SIZE + 1) * CELL_SIZE
}

/// Pad a payload to a whole number of cells
pub fn pad(payload: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(padded_len(payload.len()));
    padded.extend_from_slice(payload);
    padded.push(PADDING_MARKER);
    padded.resize(padded_len(payload.len()), 0);
    padded
}

/// Recover the payload from a padded buffer
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.is_empty() || padded.len() % CELL_SIZE != 0 {
        return Err(OnionError::InvalidPadding(format!(
            "length {} is not a positive multiple of {}",
            padded.len(),
            CELL_SIZE
        )));
    }

    let marker = padded
        .iter()
        .rposition(|&b| b != 0)
        .ok_or_else(|| OnionError::InvalidPadding("no padding marker".into()))?;

    if padded[marker] != PADDING_MARKER {
        return Err(OnionError::InvalidPadding(format!(
            "expected marker 0x{:02x}, found 0x{:02x}",
            PADDING_MARKER, padded[marker]
        )));
    }

    // The marker always sits in the last cell
    if padded.len() - marker > CELL_SIZE {
        return Err(OnionError::InvalidPadding("padding longer than one cell".into()));
    }

    Ok(padded[..marker].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_lengths() {
        assert_eq!(padded_len(0), 512);
        assert_eq!(padded_len(1), 512);
        assert_eq!(padded_len(511), 512);
        assert_eq!(padded_len(512), 1024);
        assert_eq!(padded_len(513), 1024);
        assert_eq!(padded_len(1023), 1024);
        assert_eq!(padded_len(1024), 1536);
    }

    #[test]
    fn test_pad_is_cell_aligned() {
        for len in [0usize, 1, 100, 500, 510, 511, 512, 513, 1000, 1024, 4097] {
            let payload = vec![0xAB; len];
            let padded = pad(&payload);
            assert_eq!(padded.len() % CELL_SIZE, 0, "len {}", len);
            assert!(padded.len() > len);
            assert_eq!(unpad(&padded).unwrap(), payload, "len {}", len);
        }
    }

    #[test]
    fn test_payload_ending_in_zeros_and_markers() {
        // Trailing zeros and marker-valued bytes in the payload survive
        let payloads: [&[u8]; 4] = [&[0, 0, 0], &[0x80], &[1, 0x80, 0], &[0x80; 511]];
        for payload in payloads {
            assert_eq!(unpad(&pad(payload)).unwrap(), payload);
        }
    }

    #[test]
    fn test_unpad_rejects_malformed() {
        assert!(unpad(&[]).is_err());
        assert!(unpad(&[0x80; 100]).is_err());
        assert!(unpad(&[0u8; 512]).is_err());

        let mut bad_marker = vec![0u8; 512];
        bad_marker[10] = 0x7f;
        assert!(unpad(&bad_marker).is_err());

        // Marker in the first cell followed by a whole cell of zeros
        let mut too_long = vec![0u8; 1024];
        too_long[100] = PADDING_MARKER;
        assert!(unpad(&too_long).is_err());
    }
}
