//! Storage-time block transform
//!
//! Every stored payload starts with a marker byte:
//! `0x00` for a raw block, `0x01` for an lz4 block with its size prepended.
//! Addresses are always computed over the plain block.

use super::{BlobError, BlobResult};

const MARKER_RAW: u8 = 0x00;
const MARKER_LZ4: u8 = 0x01;

/// Encode a block for storage, compressing only when it helps.
pub fn encode_block(data: &[u8], compress: bool) -> Vec<u8> {
    if compress {
        let compressed = lz4_flex::compress_prepend_size(data);
        if compressed.len() < data.len() {
            let mut stored = Vec::with_capacity(compressed.len() + 1);
            stored.push(MARKER_LZ4);
            stored.extend_from_slice(&compressed);
            return stored;
        }
    }

    let mut stored = Vec::with_capacity(data.len() + 1);
    stored.push(MARKER_RAW);
    stored.extend_from_slice(data);
    stored
}

/// Invert `encode_block`.
pub fn decode_block(stored: &[u8]) -> BlobResult<Vec<u8>> {
    let (marker, payload) = stored
        .split_first()
        .ok_or_else(|| BlobError::Corrupted("empty stored block".to_string()))?;

    match *marker {
        MARKER_RAW => Ok(payload.to_vec()),
        MARKER_LZ4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| BlobError::Corrupted(format!("lz4: {}", e))),
        other => Err(BlobError::Corrupted(format!(
            "unknown block marker 0x{:02x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_block_shrinks() {
        let data = vec![0x42u8; 4096];
        let stored = encode_block(&data, true);
        assert_eq!(stored[0], MARKER_LZ4);
        assert!(stored.len() < data.len());
        assert_eq!(decode_block(&stored).unwrap(), data);
    }

    #[test]
    fn test_incompressible_block_stays_raw() {
        let data: Vec<u8> = (0..64u32).map(|i| (i * 97 % 251) as u8).collect();
        let stored = encode_block(&data, true);
        assert_eq!(stored[0], MARKER_RAW);
        assert_eq!(decode_block(&stored).unwrap(), data);
    }

    #[test]
    fn test_compression_disabled() {
        let data = vec![0u8; 1024];
        let stored = encode_block(&data, false);
        assert_eq!(stored.len(), 1025);
        assert_eq!(decode_block(&stored).unwrap(), data);
    }

    #[test]
    fn test_empty_block_has_marker() {
        let stored = encode_block(&[], true);
        assert_eq!(stored, vec![MARKER_RAW]);
        assert!(decode_block(&stored).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_blocks() {
        assert!(matches!(decode_block(&[]), Err(BlobError::Corrupted(_))));
        assert!(matches!(decode_block(&[0x07, 1, 2]), Err(BlobError::Corrupted(_))));
        assert!(matches!(decode_block(&[MARKER_LZ4, 10, 0, 0, 0, 0xff]), Err(BlobError::Corrupted(_))));
    }
}
