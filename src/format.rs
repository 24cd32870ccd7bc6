//! Wire-format constants and the shared key dictionary.

use std::collections::HashMap;

use crate::error::{ChaosError, Result};
use crate::primitives::{compress, varint};

// Value tag families. Bytes with the top bit clear are inline strings; the
// length nibble/quintet extensions below overflow into a trailing var number.
pub(crate) const TAG_LONG_STRING: u8 = 0x7F;
pub(crate) const TAG_OBJECT_REF: u8 = 0x80;
pub(crate) const TAG_LIST_REF: u8 = 0xA0;
pub(crate) const TAG_SMALL_POS: u8 = 0xC0;
pub(crate) const TAG_SMALL_NEG: u8 = 0xD0;
pub(crate) const TAG_CUSTOM: u8 = 0xE0;
pub(crate) const TAG_INT_POS: u8 = 0xF0;
pub(crate) const TAG_INT_NEG: u8 = 0xF4;
pub(crate) const TAG_F32: u8 = 0xF8;
pub(crate) const TAG_F64: u8 = 0xF9;
pub(crate) const TAG_NULL: u8 = 0xFC;
pub(crate) const TAG_BYTE: u8 = 0xFD;
pub(crate) const TAG_FALSE: u8 = 0xFE;
pub(crate) const TAG_TRUE: u8 = 0xFF;

pub(crate) const REF_ID_EXT: u8 = 0x1F;
pub(crate) const CUSTOM_ID_EXT: u8 = 0x0F;
pub(crate) const COUNT_EXT: u8 = 0x7F;
pub(crate) const DICT_COMPRESSED: u8 = 0xFF;

/// Longest string stored inline; 127 collides with the long-string marker.
pub(crate) const INLINE_STRING_MAX: usize = 126;

/// Appends a reference tag pointing at entity `id`.
pub(crate) fn reference_tag(list: bool, id: u64, out: &mut Vec<u8>) {
    let family = if list { TAG_LIST_REF } else { TAG_OBJECT_REF };
    if id < REF_ID_EXT as u64 {
        out.push(family | id as u8);
    } else {
        out.push(family | REF_ID_EXT);
        varint::encode_var(id, out);
    }
}

/// File-scoped interning table for object keys. Append-only during an
/// encode: an index, once handed out, is stable.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: Vec<String>,
    index: HashMap<String, u64>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, key: &str) -> u64 {
        if let Some(&idx) = self.index.get(key) {
            return idx;
        }
        let idx = self.entries.len() as u64;
        self.entries.push(key.to_owned());
        self.index.insert(key.to_owned(), idx);
        idx
    }

    pub fn lookup(&self, key: &str) -> Option<u64> {
        self.index.get(key).copied()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends the dictionary's header frame: a raw byte run when it fits
    /// below the compression marker, the LZ4 form otherwise.
    pub(crate) fn write_frame(&self, out: &mut Vec<u8>) {
        let mut buf = Vec::new();
        for entry in &self.entries {
            varint::encode_var(entry.len() as u64, &mut buf);
            buf.extend_from_slice(entry.as_bytes());
        }
        if buf.len() < DICT_COMPRESSED as usize {
            out.push(buf.len() as u8);
            out.extend_from_slice(&buf);
        } else {
            let compressed = compress::compress(&buf);
            out.push(DICT_COMPRESSED);
            varint::encode_var(compressed.len() as u64, out);
            varint::encode_var(buf.len() as u64, out);
            out.extend_from_slice(&compressed);
        }
    }
}

/// Splits a decoded dictionary buffer into its key strings.
pub(crate) fn parse_entries(buf: &[u8]) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let len = varint::decode_var(buf, &mut off)? as usize;
        let end = off
            .checked_add(len)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| ChaosError::Malformed("dictionary entry extends past buffer".into()))?;
        let entry = std::str::from_utf8(&buf[off..end])
            .map_err(|_| ChaosError::Malformed("dictionary entry is not valid UTF-8".into()))?;
        entries.push(entry.to_owned());
        off = end;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_deduplicated() {
        let mut dict = Dictionary::new();
        assert_eq!(dict.intern("alpha"), 0);
        assert_eq!(dict.intern("beta"), 1);
        assert_eq!(dict.intern("alpha"), 0);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.lookup("beta"), Some(1));
        assert_eq!(dict.lookup("gamma"), None);
    }

    #[test]
    fn small_dictionary_frames_raw() {
        let mut dict = Dictionary::new();
        dict.intern("a");
        dict.intern("bc");
        let mut out = Vec::new();
        dict.write_frame(&mut out);
        assert_eq!(out, vec![5, 1, b'a', 2, b'b', b'c']);
        assert_eq!(parse_entries(&out[1..]).unwrap(), vec!["a", "bc"]);
    }

    #[test]
    fn large_dictionary_frames_compressed() {
        let mut dict = Dictionary::new();
        for i in 0..64 {
            dict.intern(&format!("field_name_with_padding_{i:04}"));
        }
        let mut out = Vec::new();
        dict.write_frame(&mut out);
        assert_eq!(out[0], DICT_COMPRESSED);

        let mut off = 1;
        let compressed_size = varint::decode_var(&out, &mut off).unwrap() as usize;
        let original_size = varint::decode_var(&out, &mut off).unwrap() as usize;
        let decompressed =
            compress::decompress(&out[off..off + compressed_size], original_size).unwrap();
        let entries = parse_entries(&decompressed).unwrap();
        assert_eq!(entries.len(), 64);
        assert_eq!(entries[0], "field_name_with_padding_0000");
    }

    #[test]
    fn reference_tags_inline_small_ids() {
        let mut out = Vec::new();
        reference_tag(false, 3, &mut out);
        assert_eq!(out, vec![0x83]);

        out.clear();
        reference_tag(true, 30, &mut out);
        assert_eq!(out, vec![0xBE]);

        out.clear();
        reference_tag(false, 31, &mut out);
        assert_eq!(out, vec![0x9F, 31]);

        out.clear();
        reference_tag(true, 500, &mut out);
        assert_eq!(out, vec![0xBF, 0x82, 0xF4, 0x01]);
    }

    #[test]
    fn malformed_dictionary_is_rejected() {
        // length prefix promises more bytes than remain
        assert!(parse_entries(&[5, b'a']).is_err());
        // invalid UTF-8 entry
        assert!(parse_entries(&[2, 0xFF, 0xFE]).is_err());
    }
}
