//! Path-guided selective decoder.
//!
//! Only the bytes on the query path are touched: object steps binary-search
//! the container's offset table against the dictionary, list steps jump
//! straight to the indexed slot. Whatever the path lands on is materialized
//! with the serial machinery.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::trace;

use crate::error::{ChaosError, Result};
use crate::model::{List, Value};

use super::{read_container_count, read_offset_width, MappedDocument, Reader, Token};

enum Target {
    Fetch,
    Keys,
    Len,
}

pub struct SelectiveDecoder {
    doc: MappedDocument,
    query: Vec<String>,
}

impl SelectiveDecoder {
    /// Maps the file and parses its header. The map is retained for the
    /// decoder's lifetime; queries can then be run repeatedly.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            doc: MappedDocument::open(path.as_ref(), HashMap::new())?,
            query: Vec::new(),
        })
    }

    pub fn register_custom_size(&mut self, id: u8, size: usize) {
        self.doc.register_custom_size(id, size);
    }

    /// Replaces the active query. Components address object fields by key
    /// and list elements by decimal index, outermost first.
    pub fn set_query<I, S>(&mut self, components: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = components.into_iter().map(Into::into).collect();
    }

    /// Decodes the value at the query path, materializing only that subtree.
    pub fn fetch(&self) -> Result<Value> {
        self.select_entity(0, 0, &Target::Fetch)
    }

    /// Returns the sorted key list of the object at the query path, or
    /// `Null` when the path lands on anything that has no keys.
    pub fn keys(&self) -> Result<Value> {
        self.select_entity(0, 0, &Target::Keys)
    }

    /// Returns the field/element count of the container at the query path,
    /// or `Null` for a scalar target.
    pub fn len(&self) -> Result<Value> {
        self.select_entity(0, 0, &Target::Len)
    }

    fn select_entity(&self, id: u64, depth: usize, target: &Target) -> Result<Value> {
        let mut r = self.doc.reader_at(id)?;
        let is_list = r.peek()? & 0x80 != 0;

        if depth == self.query.len() {
            return self.finish(id, is_list, target);
        }

        let component = self.query[depth].as_str();
        trace!(entity = id, component, "selective step");
        let token = if is_list {
            self.seek_list_element(&mut r, component)?
        } else {
            self.seek_object_field(&mut r, component)?
        };
        match token {
            Token::Ref(child) => self.select_entity(child, depth + 1, target),
            // A scalar this early ends the walk: the remaining components
            // have nothing to address.
            Token::Value(value) => Ok(match target {
                Target::Fetch => value,
                Target::Keys | Target::Len => Value::Null,
            }),
        }
    }

    fn finish(&self, id: u64, is_list: bool, target: &Target) -> Result<Value> {
        match target {
            Target::Fetch => {
                let mut active = HashSet::new();
                self.doc.decode_entity(id, &mut active)
            }
            Target::Len => {
                let mut r = self.doc.reader_at(id)?;
                let count = read_container_count(&mut r)?;
                Ok(Value::Int(count as i64))
            }
            Target::Keys => {
                if is_list {
                    return Ok(Value::Null);
                }
                let mut r = self.doc.reader_at(id)?;
                let count = read_container_count(&mut r)?;
                let width = read_offset_width(&mut r)?;
                let table = r.pos();
                let data = field_base(table, count, width)?;
                let mut keys = List::new();
                for slot in 0..count {
                    r.seek(table + slot * width);
                    let offset = r.read_fixed(width)? as usize;
                    r.seek(data_offset(data, offset)?);
                    let key = self.doc.key(r.read_var()?)?;
                    keys.push(Value::String(key.to_owned()));
                }
                Ok(Value::List(keys))
            }
        }
    }

    fn seek_object_field(&self, r: &mut Reader, component: &str) -> Result<Token> {
        let count = read_container_count(r)?;
        let width = read_offset_width(r)?;
        let table = r.pos();
        let data = field_base(table, count, width)?;

        let mut low: i64 = 0;
        let mut high: i64 = count as i64 - 1;
        while low <= high {
            let mid = low + (high - low) / 2;
            r.seek(table + mid as usize * width);
            let offset = r.read_fixed(width)? as usize;
            r.seek(data_offset(data, offset)?);
            let key = self.doc.key(r.read_var()?)?;
            match key.cmp(component) {
                Ordering::Equal => return self.doc.read_token(r),
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid - 1,
            }
        }
        Err(ChaosError::KeyNotFound(component.to_owned()))
    }

    fn seek_list_element(&self, r: &mut Reader, component: &str) -> Result<Token> {
        let count = read_container_count(r)?;
        let width = read_offset_width(r)?;
        let index: u64 = component
            .parse()
            .map_err(|_| ChaosError::MalformedIndex(component.to_owned()))?;
        if index >= count as u64 {
            return Err(ChaosError::IndexOutOfRange {
                index,
                len: count as u64,
            });
        }
        let table = r.pos();
        let data = field_base(table, count, width)?;
        r.seek(table + index as usize * width);
        let offset = r.read_fixed(width)? as usize;
        r.seek(data_offset(data, offset)?);
        self.doc.read_token(r)
    }
}

fn field_base(table: usize, count: usize, width: usize) -> Result<usize> {
    count
        .checked_mul(width)
        .and_then(|len| table.checked_add(len))
        .ok_or_else(|| ChaosError::Malformed("offset table length overflow".into()))
}

fn data_offset(base: usize, offset: usize) -> Result<usize> {
    base.checked_add(offset)
        .ok_or_else(|| ChaosError::Malformed("field offset overflow".into()))
}
