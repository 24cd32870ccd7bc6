//! Mapped-file decoding.
//!
//! Every decoder starts the same way: map the file read-only, parse the
//! header (dictionary, entity-offset table), and remember where the body
//! begins. The serial decoder here materializes the whole tree from entity
//! 0, recursing through reference tags; the parallel and selective variants
//! build on the same parsed state.

pub mod parallel;
pub mod selective;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::{ChaosError, Result};
use crate::format;
use crate::model::{Custom, List, Object, Value};
use crate::primitives::{compress, varint};

/// Bounds-checked cursor over the mapped bytes. Each decode frame owns its
/// own reader, so reference jumps never disturb the caller's position.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub(crate) fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| ChaosError::Malformed("unexpected end of file".into()))
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| ChaosError::Malformed("unexpected end of file".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub(crate) fn read_var(&mut self) -> Result<u64> {
        varint::decode_var(self.data, &mut self.pos)
    }

    pub(crate) fn read_fixed(&mut self, width: usize) -> Result<u64> {
        Ok(varint::decode_fixed(self.read_bytes(width)?))
    }
}

/// One decoded body token: either an inline scalar or a reference to
/// another entity.
pub(crate) enum Token {
    Value(Value),
    Ref(u64),
}

/// A mapped file with its header parsed: the decoded dictionary, the
/// entity-offset table, and the body base offset.
pub(crate) struct MappedDocument {
    map: Mmap,
    dictionary: Vec<String>,
    entity_table: Vec<u64>,
    base: usize,
    custom_sizes: HashMap<u8, usize>,
}

impl MappedDocument {
    pub(crate) fn open(path: &Path, custom_sizes: HashMap<u8, usize>) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(ChaosError::Malformed("empty file".into()));
        }
        let map = unsafe { Mmap::map(&file) }?;

        let mut r = Reader::new(&map, 0);
        let header_size = r.read_var()? as usize;
        let prefix_len = r.pos();
        let entity_count = r.read_var()? as usize;

        let dict_flag = r.read_byte()?;
        let dictionary = if dict_flag == format::DICT_COMPRESSED {
            let compressed_size = r.read_var()? as usize;
            let original_size = r.read_var()? as usize;
            let raw = r.read_bytes(compressed_size)?;
            format::parse_entries(&compress::decompress(raw, original_size)?)?
        } else {
            format::parse_entries(r.read_bytes(dict_flag as usize)?)?
        };

        let width = read_offset_width(&mut r)?;
        entity_count
            .checked_mul(width)
            .filter(|&need| need <= map.len().saturating_sub(r.pos()))
            .ok_or_else(|| ChaosError::Malformed("entity table extends past end of file".into()))?;
        let mut entity_table = Vec::with_capacity(entity_count);
        for _ in 0..entity_count {
            entity_table.push(r.read_fixed(width)?);
        }

        if r.pos() != prefix_len + header_size {
            return Err(ChaosError::Malformed("header size mismatch".into()));
        }
        let base = r.pos();
        debug!(
            entities = entity_table.len(),
            keys = dictionary.len(),
            "parsed container header"
        );
        Ok(Self {
            map,
            dictionary,
            entity_table,
            base,
            custom_sizes,
        })
    }

    pub(crate) fn register_custom_size(&mut self, id: u8, size: usize) {
        self.custom_sizes.insert(id, size);
    }

    pub(crate) fn entity_count(&self) -> usize {
        self.entity_table.len()
    }

    pub(crate) fn reader_at(&self, id: u64) -> Result<Reader<'_>> {
        let offset = self
            .entity_table
            .get(id as usize)
            .copied()
            .ok_or_else(|| ChaosError::Malformed(format!("entity id {id} out of range")))?;
        let pos = self
            .base
            .checked_add(offset as usize)
            .filter(|&pos| pos < self.map.len())
            .ok_or_else(|| ChaosError::Malformed("entity offset past end of file".into()))?;
        Ok(Reader::new(&self.map, pos))
    }

    pub(crate) fn key(&self, idx: u64) -> Result<&str> {
        self.dictionary
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| ChaosError::Malformed(format!("invalid key index {idx}")))
    }

    /// Reads one value token at the cursor. Shared by every decode path;
    /// only the handling of the returned reference differs between them.
    pub(crate) fn read_token(&self, r: &mut Reader) -> Result<Token> {
        let byte = r.read_byte()?;

        if byte & 0x80 == 0 {
            if byte == format::TAG_LONG_STRING {
                let compressed_size = r.read_var()? as usize;
                let original_size = r.read_var()? as usize;
                let raw = r.read_bytes(compressed_size)?;
                let bytes = compress::decompress(raw, original_size)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| ChaosError::Malformed("string is not valid UTF-8".into()))?;
                return Ok(Token::Value(Value::String(s)));
            }
            let bytes = r.read_bytes((byte & 0x7F) as usize)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| ChaosError::Malformed("string is not valid UTF-8".into()))?;
            return Ok(Token::Value(Value::String(s.to_owned())));
        }

        if matches!(byte & 0xE0, format::TAG_OBJECT_REF | format::TAG_LIST_REF) {
            let mut id = (byte & 0x1F) as u64;
            if id == format::REF_ID_EXT as u64 {
                id = r.read_var()?;
            }
            return Ok(Token::Ref(id));
        }

        match byte & 0xF0 {
            format::TAG_SMALL_POS => Ok(Token::Value(Value::Int((byte & 0x0F) as i64))),
            format::TAG_SMALL_NEG => Ok(Token::Value(Value::Int(-((byte & 0x0F) as i64)))),
            format::TAG_CUSTOM => {
                let mut id = (byte & 0x0F) as u64;
                if id == format::CUSTOM_ID_EXT as u64 {
                    id = r.read_var()?;
                }
                let id = u8::try_from(id).map_err(|_| {
                    ChaosError::Malformed(format!("custom id {id} exceeds one byte"))
                })?;
                let size = self.custom_sizes.get(&id).copied().ok_or_else(|| {
                    ChaosError::Malformed(format!("no registered size for custom id {id}"))
                })?;
                let data = r.read_bytes(size)?.to_vec();
                Ok(Token::Value(Value::Custom(Custom { id, data })))
            }
            0xF0 => self.read_wide_token(byte & 0x0F, r),
            _ => Err(ChaosError::Malformed(format!(
                "unknown value tag 0x{byte:02X}"
            ))),
        }
    }

    fn read_wide_token(&self, subtype: u8, r: &mut Reader) -> Result<Token> {
        match subtype {
            0x0C => Ok(Token::Value(Value::Null)),
            0x0D => Ok(Token::Value(Value::Byte(r.read_byte()?))),
            0x0E => Ok(Token::Value(Value::Bool(false))),
            0x0F => Ok(Token::Value(Value::Bool(true))),
            0x00..=0x07 => {
                let width = 1usize << (subtype & 0x03);
                let raw = r.read_fixed(width)?;
                let value = if subtype & 0x04 != 0 {
                    (raw as i64).wrapping_neg()
                } else {
                    raw as i64
                };
                Ok(Token::Value(Value::Int(value)))
            }
            0x08 => {
                let bytes: [u8; 4] = r.read_bytes(4)?.try_into().expect("slice is 4 bytes");
                Ok(Token::Value(Value::Float(f32::from_le_bytes(bytes) as f64)))
            }
            0x09 => {
                let bytes: [u8; 8] = r.read_bytes(8)?.try_into().expect("slice is 8 bytes");
                Ok(Token::Value(Value::Float(f64::from_le_bytes(bytes))))
            }
            _ => Err(ChaosError::Malformed(format!(
                "unknown wide tag subtype 0x{subtype:X}"
            ))),
        }
    }

    /// Fully materializes entity `id`, recursing through references. A
    /// reference back into an entity still on the decode path yields `Null`
    /// instead of looping.
    pub(crate) fn decode_entity(&self, id: u64, active: &mut HashSet<u64>) -> Result<Value> {
        if !active.insert(id) {
            warn!(entity = id, "cyclic reference; substituting null");
            return Ok(Value::Null);
        }
        let mut r = self.reader_at(id)?;
        let value = self.decode_container(&mut r, active)?;
        active.remove(&id);
        Ok(value)
    }

    fn decode_container(&self, r: &mut Reader, active: &mut HashSet<u64>) -> Result<Value> {
        if r.peek()? & 0x80 != 0 {
            self.decode_list(r, active)
        } else {
            self.decode_object(r, active)
        }
    }

    fn decode_object(&self, r: &mut Reader, active: &mut HashSet<u64>) -> Result<Value> {
        let count = read_container_count(r)?;
        let width = read_offset_width(r)?;
        skip_offset_table(r, count, width)?;
        let mut obj = Object::new();
        for _ in 0..count {
            let key = self.key(r.read_var()?)?.to_owned();
            let value = match self.read_token(r)? {
                Token::Value(v) => v,
                Token::Ref(child) => self.decode_entity(child, active)?,
            };
            obj.insert(key, value);
        }
        Ok(Value::Object(obj))
    }

    fn decode_list(&self, r: &mut Reader, active: &mut HashSet<u64>) -> Result<Value> {
        let count = read_container_count(r)?;
        let width = read_offset_width(r)?;
        skip_offset_table(r, count, width)?;
        let mut list = List::new();
        for _ in 0..count {
            let value = match self.read_token(r)? {
                Token::Value(v) => v,
                Token::Ref(child) => self.decode_entity(child, active)?,
            };
            list.push(value);
        }
        Ok(Value::List(list))
    }

    /// Decodes entity `id` leaving reference tags as `Value::Reference`,
    /// for the parallel workers' first phase.
    pub(crate) fn decode_entity_raw(&self, id: u64) -> Result<Value> {
        let mut r = self.reader_at(id)?;
        if r.peek()? & 0x80 != 0 {
            let count = read_container_count(&mut r)?;
            let width = read_offset_width(&mut r)?;
            skip_offset_table(&mut r, count, width)?;
            let mut list = List::new();
            for _ in 0..count {
                list.push(self.read_value_raw(&mut r)?);
            }
            Ok(Value::List(list))
        } else {
            let count = read_container_count(&mut r)?;
            let width = read_offset_width(&mut r)?;
            skip_offset_table(&mut r, count, width)?;
            let mut obj = Object::new();
            for _ in 0..count {
                let key = self.key(r.read_var()?)?.to_owned();
                let value = self.read_value_raw(&mut r)?;
                obj.insert(key, value);
            }
            Ok(Value::Object(obj))
        }
    }

    fn read_value_raw(&self, r: &mut Reader) -> Result<Value> {
        Ok(match self.read_token(r)? {
            Token::Value(v) => v,
            Token::Ref(id) => Value::Reference(id),
        })
    }
}

/// Reads a container's element count from its first byte(s). The low seven
/// bits saturated (0x7F) mean the true count follows as a var number.
pub(crate) fn read_container_count(r: &mut Reader) -> Result<usize> {
    let byte = r.read_byte()?;
    let count = (byte & 0x7F) as u64;
    if count == format::COUNT_EXT as u64 {
        return Ok(r.read_var()? as usize);
    }
    Ok(count as usize)
}

pub(crate) fn read_offset_width(r: &mut Reader) -> Result<usize> {
    let width = r.read_byte()? as usize;
    if !matches!(width, 1 | 2 | 4 | 8) {
        return Err(ChaosError::Malformed(format!(
            "invalid offset width {width}"
        )));
    }
    Ok(width)
}

fn skip_offset_table(r: &mut Reader, count: usize, width: usize) -> Result<()> {
    let len = count
        .checked_mul(width)
        .ok_or_else(|| ChaosError::Malformed("offset table length overflow".into()))?;
    r.skip(len)
}

/// Serial whole-document decoder.
pub struct Decoder {
    custom_sizes: HashMap<u8, usize>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            custom_sizes: HashMap::new(),
        }
    }

    /// Registers the payload size the decoder should consume for custom
    /// values carrying `id`.
    pub fn register_custom_size(&mut self, id: u8, size: usize) {
        self.custom_sizes.insert(id, size);
    }

    pub fn decode(&self, path: impl AsRef<Path>) -> Result<Value> {
        let doc = MappedDocument::open(path.as_ref(), self.custom_sizes.clone())?;
        let mut active = HashSet::new();
        doc.decode_entity(0, &mut active)
    }
}

/// Decodes a whole document serially with no custom sizes registered.
pub fn decode(path: impl AsRef<Path>) -> Result<Value> {
    Decoder::new().decode(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_rejects_reads_past_end() {
        let data = [1u8, 2, 3];
        let mut r = Reader::new(&data, 0);
        assert_eq!(r.read_byte().unwrap(), 1);
        assert_eq!(r.read_bytes(2).unwrap(), &[2, 3]);
        assert!(r.read_byte().is_err());

        let mut r = Reader::new(&data, 0);
        assert!(r.read_bytes(4).is_err());
    }

    #[test]
    fn reader_seek_then_bounds_check() {
        let data = [0u8; 4];
        let mut r = Reader::new(&data, 0);
        r.seek(10);
        assert!(r.read_byte().is_err());
    }

    #[test]
    fn offset_width_must_be_power_of_two() {
        for width in [1u8, 2, 4, 8] {
            let data = [width];
            let mut r = Reader::new(&data, 0);
            assert_eq!(read_offset_width(&mut r).unwrap(), width as usize);
        }
        for width in [0u8, 3, 5, 9] {
            let data = [width];
            let mut r = Reader::new(&data, 0);
            assert!(read_offset_width(&mut r).is_err());
        }
    }

    #[test]
    fn container_count_extension() {
        // Inline object count.
        let inline_obj = [0x05];
        let mut r = Reader::new(&inline_obj, 0);
        assert_eq!(read_container_count(&mut r).unwrap(), 5);
        // Extended object count: marker then var number.
        let ext_obj = [0x7F, 0x81, 0x80];
        let mut r = Reader::new(&ext_obj, 0);
        assert_eq!(read_container_count(&mut r).unwrap(), 128);
        // Inline and extended list counts share the same low bits.
        let inline_list = [0x82];
        let mut r = Reader::new(&inline_list, 0);
        assert_eq!(read_container_count(&mut r).unwrap(), 2);
        let ext_list = [0xFF, 0x81, 0x80];
        let mut r = Reader::new(&ext_list, 0);
        assert_eq!(read_container_count(&mut r).unwrap(), 128);
    }
}
