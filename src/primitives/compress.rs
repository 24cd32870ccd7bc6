//! LZ4 block compression for long strings and the key dictionary.
//!
//! The surrounding format stores both the compressed and the original size,
//! so bare blocks are used with no extra framing.

use crate::error::{ChaosError, Result};

pub fn compress(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }
    lz4_flex::block::compress(input)
}

pub fn decompress(input: &[u8], original_size: usize) -> Result<Vec<u8>> {
    if original_size == 0 {
        if !input.is_empty() {
            return Err(ChaosError::Decompression(
                "nonempty block for empty output".into(),
            ));
        }
        return Ok(Vec::new());
    }
    lz4_flex::block::decompress(input, original_size)
        .map_err(|err| ChaosError::Decompression(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let input = b"the quick brown fox jumps over the lazy dog".repeat(32);
        let compressed = compress(&input);
        assert!(compressed.len() < input.len());
        assert_eq!(decompress(&compressed, input.len()).unwrap(), input);
    }

    #[test]
    fn empty_input_is_empty_block() {
        assert!(compress(&[]).is_empty());
        assert_eq!(decompress(&[], 0).unwrap(), Vec::<u8>::new());
        assert!(decompress(&[1, 2, 3], 0).is_err());
    }

    #[test]
    fn corrupted_block_is_rejected() {
        let compressed = compress(b"some payload worth compressing, repeated a few times over");
        let mut broken = compressed.clone();
        broken.truncate(compressed.len() / 2);
        assert!(decompress(&broken, 58).is_err());
    }
}
