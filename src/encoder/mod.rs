//! Serial document encoder.
//!
//! The value tree is flattened into numbered entities: the root is entity 0
//! and every nested container is promoted to its own entity, replaced in the
//! parent body by a reference tag. A FIFO worklist keeps entity bodies in
//! ascending id order in the file.

pub mod parallel;

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ChaosError, Result};
use crate::format::{self, Dictionary};
use crate::model::{List, Object, Value};
use crate::primitives::{compress, varint};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Always emit binary64 floats instead of narrowing values inside the
    /// single-precision range.
    pub wide_floats: bool,
    /// Worker-pool size for the parallel encoder; `None` uses the machine's
    /// available parallelism with a fallback of 4.
    pub workers: Option<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            wide_floats: false,
            workers: None,
        }
    }
}

pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Per-entity encoding context: resolves key indices and hands out entity
/// ids for container children. The serial encoder allocates ids on the fly;
/// parallel workers replay ids fixed by the assignment pre-pass.
pub(crate) trait EncodeCx<'a> {
    fn key_index(&mut self, key: &str) -> Result<u64>;
    fn child_id(&mut self, child: &'a Value) -> Result<u64>;
}

pub struct Encoder {
    config: EncoderConfig,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_config(EncoderConfig::default())
    }

    pub fn with_config(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn encode(&self, root: &Value, path: impl AsRef<Path>) -> Result<()> {
        if !root.is_container() {
            return Err(ChaosError::InvalidArgument(
                "document root must be an object or a list".into(),
            ));
        }

        let mut dict = Dictionary::new();
        let mut body = Vec::with_capacity(1024 * 1024);
        let mut offsets: Vec<u64> = Vec::new();
        let mut queue: VecDeque<&Value> = VecDeque::new();
        let mut next_id: u64 = 1;

        queue.push_back(root);
        while let Some(value) = queue.pop_front() {
            offsets.push(body.len() as u64);
            let mut cx = SerialCx {
                dict: &mut dict,
                queue: &mut queue,
                next_id: &mut next_id,
            };
            encode_entity(&mut cx, value, self.config.wide_floats, &mut body)?;
        }

        let header = build_header(&dict, &offsets, body.len());
        write_file(path.as_ref(), &header, &body)?;
        debug!(
            entities = offsets.len(),
            body_bytes = body.len(),
            dict_keys = dict.len(),
            "encoded document"
        );
        Ok(())
    }
}

struct SerialCx<'a, 'b> {
    dict: &'b mut Dictionary,
    queue: &'b mut VecDeque<&'a Value>,
    next_id: &'b mut u64,
}

impl<'a, 'b> EncodeCx<'a> for SerialCx<'a, 'b> {
    fn key_index(&mut self, key: &str) -> Result<u64> {
        Ok(self.dict.intern(key))
    }

    fn child_id(&mut self, child: &'a Value) -> Result<u64> {
        let id = *self.next_id;
        *self.next_id += 1;
        self.queue.push_back(child);
        Ok(id)
    }
}

/// Writes one container body: count tag, offset width, offset table, then
/// the concatenated field/element payloads.
pub(crate) fn encode_entity<'a>(
    cx: &mut impl EncodeCx<'a>,
    value: &'a Value,
    wide_floats: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    match value {
        Value::Object(obj) => encode_object(cx, obj, wide_floats, out),
        Value::List(list) => encode_list(cx, list, wide_floats, out),
        _ => Err(ChaosError::InvalidArgument(
            "only objects and lists become entities".into(),
        )),
    }
}

fn encode_object<'a>(
    cx: &mut impl EncodeCx<'a>,
    obj: &'a Object,
    wide_floats: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(obj.len());
    for (key, value) in obj.iter() {
        offsets.push(data.len() as u64);
        let idx = cx.key_index(key)?;
        varint::encode_var(idx, &mut data);
        encode_field(cx, value, wide_floats, &mut data)?;
    }
    write_frame(false, obj.len(), &offsets, &data, out);
    Ok(())
}

fn encode_list<'a>(
    cx: &mut impl EncodeCx<'a>,
    list: &'a List,
    wide_floats: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(list.len());
    for value in list.iter() {
        offsets.push(data.len() as u64);
        encode_field(cx, value, wide_floats, &mut data)?;
    }
    write_frame(true, list.len(), &offsets, &data, out);
    Ok(())
}

fn encode_field<'a>(
    cx: &mut impl EncodeCx<'a>,
    value: &'a Value,
    wide_floats: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    match value {
        Value::Object(_) => {
            let id = cx.child_id(value)?;
            format::reference_tag(false, id, out);
            Ok(())
        }
        Value::List(_) => {
            let id = cx.child_id(value)?;
            format::reference_tag(true, id, out);
            Ok(())
        }
        _ => encode_primitive(value, wide_floats, out),
    }
}

fn write_frame(list: bool, count: usize, offsets: &[u64], data: &[u8], out: &mut Vec<u8>) {
    let family: u8 = if list { 0x80 } else { 0x00 };
    if count < format::COUNT_EXT as usize {
        out.push(family | count as u8);
    } else {
        out.push(family | format::COUNT_EXT);
        varint::encode_var(count as u64, out);
    }
    let width = varint::nearest_bytes(data.len() as u64);
    out.push(width as u8);
    for &offset in offsets {
        varint::encode_fixed(offset, width, out);
    }
    out.extend_from_slice(data);
}

pub(crate) fn encode_primitive(value: &Value, wide_floats: bool, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.push(format::TAG_NULL),
        Value::Bool(true) => out.push(format::TAG_TRUE),
        Value::Bool(false) => out.push(format::TAG_FALSE),
        Value::Byte(b) => {
            out.push(format::TAG_BYTE);
            out.push(*b);
        }
        Value::Int(n) => encode_int(*n, out),
        Value::Float(f) => encode_float(*f, wide_floats, out),
        Value::String(s) => encode_string(s, out),
        Value::Custom(custom) => {
            if custom.id < format::CUSTOM_ID_EXT {
                out.push(format::TAG_CUSTOM | custom.id);
            } else {
                out.push(format::TAG_CUSTOM | format::CUSTOM_ID_EXT);
                varint::encode_var(custom.id as u64, out);
            }
            out.extend_from_slice(&custom.data);
        }
        Value::Reference(_) => {
            return Err(ChaosError::InvalidArgument(
                "reference values cannot appear in encoder input".into(),
            ))
        }
        Value::Object(_) | Value::List(_) => return Err(ChaosError::Unsupported("container")),
    }
    Ok(())
}

fn encode_int(n: i64, out: &mut Vec<u8>) {
    // i64::MIN has no positive image; its two's-complement magnitude
    // round-trips through the 8-byte negative form.
    let (negative, magnitude) = if n >= 0 {
        (false, n as u64)
    } else {
        (true, (n as u64).wrapping_neg())
    };

    if magnitude < 16 {
        let family = if negative {
            format::TAG_SMALL_NEG
        } else {
            format::TAG_SMALL_POS
        };
        out.push(family | magnitude as u8);
        return;
    }

    let family = if negative {
        format::TAG_INT_NEG
    } else {
        format::TAG_INT_POS
    };
    let selector: u8 = match varint::nearest_bytes(magnitude) {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    };
    out.push(family | selector);
    varint::encode_fixed(magnitude, 1usize << selector, out);
}

fn encode_float(f: f64, wide_floats: bool, out: &mut Vec<u8>) {
    // NaN and infinities fail the range test and stay binary64.
    if !wide_floats && f >= -(f32::MAX as f64) && f <= f32::MAX as f64 {
        out.push(format::TAG_F32);
        out.extend_from_slice(&(f as f32).to_le_bytes());
    } else {
        out.push(format::TAG_F64);
        out.extend_from_slice(&f.to_le_bytes());
    }
}

fn encode_string(s: &str, out: &mut Vec<u8>) {
    let bytes = s.as_bytes();
    if bytes.len() <= format::INLINE_STRING_MAX {
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    } else {
        out.push(format::TAG_LONG_STRING);
        let compressed = compress::compress(bytes);
        varint::encode_var(compressed.len() as u64, out);
        varint::encode_var(bytes.len() as u64, out);
        out.extend_from_slice(&compressed);
    }
}

pub(crate) fn build_header(dict: &Dictionary, offsets: &[u64], body_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(4096);
    varint::encode_var(offsets.len() as u64, &mut header);
    dict.write_frame(&mut header);
    let width = varint::nearest_bytes(body_len as u64);
    header.push(width as u8);
    for &offset in offsets {
        varint::encode_fixed(offset, width, &mut header);
    }
    header
}

/// Writes `varint(header len) + header + body` to a temp sibling and renames
/// it over `path`, so readers never observe a partial file.
pub(crate) fn write_file(path: &Path, header: &[u8], body: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let result = (|| -> Result<()> {
        let mut prefix = Vec::new();
        varint::encode_var(header.len() as u64, &mut prefix);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&prefix)?;
        file.write_all(header)?;
        file.write_all(body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
