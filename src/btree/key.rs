//! Module `key` implement the ordered composite-key codec.
//!
//! An index is described by a [KeyOrder], the per-field
//! ascending/descending vector supplied at index creation. For every
//! document the codec emits one composite key -- or several, when an
//! indexed field holds an array -- as a byte-string of self-delimiting
//! encoded fields. Within one field the encoding is order-preserving:
//! plain byte comparison of two encoded fields agrees with the value
//! order. The composite comparator walks field by field, compares bytes
//! and applies the field's direction sign; full ties are broken by the
//! owning record's locator, but that is the B-tree's business.
//!
//! Cross-type order: Null < Bool < Number < Text < Bytes < Array < Object.
//! Integers and floats share the Number rank and compare numerically
//! through an f64 image; the exact i64 payload rides behind it so that
//! decoding is the identity.

use std::{cmp, convert::TryInto, fmt, result};

use crate::{
    doc::{Doc, Value},
    util, Error, Result,
};

const TAG_NULL: u8 = 0x02;
const TAG_FALSE: u8 = 0x03;
const TAG_TRUE: u8 = 0x04;
const TAG_NUMBER: u8 = 0x10;
const TAG_TEXT: u8 = 0x20;
const TAG_BYTES: u8 = 0x30;
const TAG_ARRAY: u8 = 0x40;
const TAG_OBJECT: u8 = 0x50;
// Sentinel above every storable value, used only by range-scan bounds.
const TAG_MAX: u8 = 0xFE;

const SIGN: u64 = 0x8000_0000_0000_0000;

/// Per-field ordering vector for one index, `(field, +1 | -1)` pairs in
/// user-supplied order.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyOrder {
    fields: Vec<(String, i8)>,
}

impl KeyOrder {
    pub fn new(fields: Vec<(String, i8)>) -> Result<KeyOrder> {
        if fields.is_empty() {
            err_at!(InvalidInput, msg: "empty key ordering")?
        }
        for (name, dir) in fields.iter() {
            if name.is_empty() {
                err_at!(InvalidInput, msg: "empty field name in ordering")?
            }
            if *dir != 1 && *dir != -1 {
                err_at!(InvalidInput, msg: "direction {} for {:?}", dir, name)?
            }
        }
        Ok(KeyOrder { fields })
    }

    /// On-disk form, a small document of `{field: +1 | -1}`.
    pub fn to_doc(&self) -> Doc {
        let pairs: Vec<(String, Value)> = self
            .fields
            .iter()
            .map(|(f, d)| (f.clone(), Value::Integer(i64::from(*d))))
            .collect();
        Doc::from(pairs)
    }

    pub fn from_doc(doc: &Doc) -> Result<KeyOrder> {
        let mut fields = vec![];
        for p in doc.pairs.iter() {
            match p.value {
                Value::Integer(d @ 1) | Value::Integer(d @ -1) => {
                    fields.push((p.field.clone(), d as i8))
                }
                _ => err_at!(InvalidFile, msg: "ordering direction for {:?}", p.field)?,
            }
        }
        KeyOrder::new(fields)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn as_fields(&self) -> &[(String, i8)] {
        &self.fields
    }
}

impl fmt::Display for KeyOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let parts: Vec<String> =
            self.fields.iter().map(|(n, d)| format!("{}:{:+}", n, d)).collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

/// One encoded composite key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    data: Vec<u8>,
}

impl IndexKey {
    /// Encode one value per ordering field, in ordering-field order.
    pub fn encode(values: &[Value]) -> Result<IndexKey> {
        let mut data = vec![];
        for value in values.iter() {
            enc_value(value, &mut data)?;
        }
        Ok(IndexKey { data })
    }

    /// Wrap already-encoded bytes, validating field structure against the
    /// expected field count.
    pub fn from_bytes(buf: &[u8], n_fields: usize) -> Result<IndexKey> {
        let mut off = 0;
        for _ in 0..n_fields {
            off += field_len(&buf[off..])?;
        }
        if off != buf.len() {
            err_at!(Corruption, msg: "key bytes {} fields {}", buf.len(), n_fields)?
        }
        Ok(IndexKey { data: buf.to_vec() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode back to one value per field. Identity over `encode`.
    pub fn to_values(&self, n_fields: usize) -> Result<Vec<Value>> {
        let mut values = vec![];
        let mut buf = &self.data[..];
        for _ in 0..n_fields {
            let (value, n) = dec_value(buf)?;
            values.push(value);
            buf = &buf[n..];
        }
        if !buf.is_empty() {
            err_at!(Corruption, msg: "trailing {} bytes in key", buf.len())?
        }
        Ok(values)
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "IndexKey<{:02x?}>", self.data)
    }
}

/// Compare two encoded composite keys under `order`, field by field,
/// applying each field's direction sign, first non-zero wins.
pub fn compare(a: &[u8], b: &[u8], order: &KeyOrder) -> Result<cmp::Ordering> {
    let (mut xs, mut ys) = (a, b);
    for (_, dir) in order.fields.iter() {
        let (n, m) = (field_len(xs)?, field_len(ys)?);
        let ord = xs[..n].cmp(&ys[..m]);
        let ord = if *dir < 0 { ord.reverse() } else { ord };
        if ord != cmp::Ordering::Equal {
            return Ok(ord);
        }
        xs = &xs[n..];
        ys = &ys[m..];
    }
    Ok(cmp::Ordering::Equal)
}

/// Compute the set of composite keys `doc` produces under `order`.
///
/// A field that is missing from the document contributes Null. One
/// array-valued field fans out into one key per element -- the multikey
/// case, an empty array contributing Null -- and the result is sorted by
/// encoded bytes and de-duplicated. Two array-valued fields cannot be
/// indexed together.
pub fn keys_for_doc(order: &KeyOrder, doc: &Doc) -> Result<Vec<IndexKey>> {
    let values: Vec<Value> = order
        .fields
        .iter()
        .map(|(f, _)| doc.get(f).cloned().unwrap_or(Value::Null))
        .collect();

    let arrays: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| match v {
            Value::Array(_) => Some(i),
            _ => None,
        })
        .collect();

    let mut keys = match arrays.len() {
        0 => vec![IndexKey::encode(&values)?],
        1 => {
            let i = arrays[0];
            let elems = match &values[i] {
                Value::Array(elems) if elems.is_empty() => vec![Value::Null],
                Value::Array(elems) => elems.clone(),
                _ => unreachable!(),
            };
            let mut keys = vec![];
            for elem in elems.into_iter() {
                let mut vs = values.clone();
                vs[i] = elem;
                keys.push(IndexKey::encode(&vs)?);
            }
            keys
        }
        _ => err_at!(
            InvalidInput, msg: "cannot index parallel arrays {}", order
        )?,
    };

    keys.sort_by(|a, b| a.data.cmp(&b.data));
    keys.dedup();
    Ok(keys)
}

/// A key made of the smallest field values, used as range-scan sentinel.
pub fn min_key(order: &KeyOrder) -> IndexKey {
    let values = vec![Value::Null; order.len()];
    // Null encodes without failure.
    IndexKey::encode(&values).unwrap()
}

/// A key above every storable key, used as range-scan sentinel. Never
/// stored in a bucket.
pub fn max_key(order: &KeyOrder) -> IndexKey {
    IndexKey { data: vec![TAG_MAX; order.len()] }
}

fn enc_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Float(f) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64(*f));
            out.push(0);
        }
        Value::Integer(i) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64(*i as f64));
            out.push(1);
            out.extend_from_slice(&(((*i as u64) ^ SIGN).to_be_bytes()));
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            enc_escaped(s.as_bytes(), out);
        }
        Value::Bytes(bs) => {
            out.push(TAG_BYTES);
            enc_escaped(bs, out);
        }
        Value::Array(elems) => {
            out.push(TAG_ARRAY);
            for elem in elems.iter() {
                enc_value(elem, out)?;
            }
            out.push(0);
        }
        Value::Object(doc) => {
            out.push(TAG_OBJECT);
            for p in doc.pairs.iter() {
                if p.field.is_empty() {
                    err_at!(InvalidInput, msg: "empty field name in key object")?
                }
                enc_escaped(p.field.as_bytes(), out);
                enc_value(&p.value, out)?;
            }
            out.extend_from_slice(&[0, 0]);
        }
    }
    Ok(())
}

// Zero bytes escape to [0x00, 0xFF]; [0x00, 0x00] terminates. Preserves
// byte order and keeps fields self-delimiting.
fn enc_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for b in bytes.iter() {
        match b {
            0x00 => out.extend_from_slice(&[0x00, 0xFF]),
            b => out.push(*b),
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

fn dec_escaped(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = vec![];
    let mut i = 0;
    loop {
        match buf.get(i) {
            Some(0x00) => match buf.get(i + 1) {
                Some(0xFF) => {
                    out.push(0x00);
                    i += 2;
                }
                Some(0x00) => break Ok((out, i + 2)),
                _ => break err_at!(Corruption, msg: "bad escape in key"),
            },
            Some(b) => {
                out.push(*b);
                i += 1;
            }
            None => break err_at!(Corruption, msg: "unterminated key field"),
        }
    }
}

fn dec_value(buf: &[u8]) -> Result<(Value, usize)> {
    let tag = match buf.first() {
        Some(tag) => *tag,
        None => err_at!(Corruption, msg: "empty key field")?,
    };
    match tag {
        TAG_NULL => Ok((Value::Null, 1)),
        TAG_FALSE => Ok((Value::Bool(false), 1)),
        TAG_TRUE => Ok((Value::Bool(true), 1)),
        TAG_NUMBER => {
            if buf.len() < 10 {
                err_at!(Corruption, msg: "short number field")?
            }
            let image = u64::from_be_bytes(buf[1..9].try_into().unwrap());
            match buf[9] {
                0 => Ok((Value::Float(unordered_f64(image)), 10)),
                1 => {
                    if buf.len() < 18 {
                        err_at!(Corruption, msg: "short integer field")?
                    }
                    let u = u64::from_be_bytes(buf[10..18].try_into().unwrap());
                    Ok((Value::Integer((u ^ SIGN) as i64), 18))
                }
                k => err_at!(Corruption, msg: "number kind {}", k),
            }
        }
        TAG_TEXT => {
            let (bytes, n) = dec_escaped(&buf[1..])?;
            let s = err_at!(FailConvert, String::from_utf8(bytes))?;
            Ok((Value::Text(s), n + 1))
        }
        TAG_BYTES => {
            let (bytes, n) = dec_escaped(&buf[1..])?;
            Ok((Value::Bytes(bytes), n + 1))
        }
        TAG_ARRAY => {
            let mut elems = vec![];
            let mut i = 1;
            loop {
                match buf.get(i) {
                    Some(0x00) => break Ok((Value::Array(elems), i + 1)),
                    Some(_) => {
                        let (elem, n) = dec_value(&buf[i..])?;
                        elems.push(elem);
                        i += n;
                    }
                    None => break err_at!(Corruption, msg: "unterminated array"),
                }
            }
        }
        TAG_OBJECT => {
            let mut pairs: Vec<(String, Value)> = vec![];
            let mut i = 1;
            loop {
                match (buf.get(i), buf.get(i + 1)) {
                    (Some(0x00), Some(0x00)) => {
                        break Ok((Value::Object(Doc::from(pairs)), i + 2))
                    }
                    (Some(_), _) => {
                        let (name, n) = dec_escaped(&buf[i..])?;
                        let name = err_at!(FailConvert, String::from_utf8(name))?;
                        i += n;
                        let (value, n) = dec_value(&buf[i..])?;
                        pairs.push((name, value));
                        i += n;
                    }
                    _ => break err_at!(Corruption, msg: "unterminated object"),
                }
            }
        }
        tag => err_at!(Corruption, msg: "key field tag {:#x}", tag),
    }
}

/// Length in bytes of the first encoded field in `buf`.
pub fn field_len(buf: &[u8]) -> Result<usize> {
    let tag = match buf.first() {
        Some(tag) => *tag,
        None => err_at!(Corruption, msg: "empty key field")?,
    };
    match tag {
        TAG_NULL | TAG_FALSE | TAG_TRUE | TAG_MAX => Ok(1),
        TAG_NUMBER => match buf.get(9) {
            Some(0) => Ok(10),
            Some(1) if buf.len() >= 18 => Ok(18),
            _ => err_at!(Corruption, msg: "short number field"),
        },
        TAG_TEXT | TAG_BYTES => {
            let (_, n) = dec_escaped(&buf[1..])?;
            Ok(n + 1)
        }
        TAG_ARRAY | TAG_OBJECT => {
            let (_, n) = dec_value(buf)?;
            Ok(n)
        }
        tag => err_at!(Corruption, msg: "key field tag {:#x}", tag),
    }
}

// Order-preserving image of an f64: positive values get the sign bit set,
// negative values are bit-complemented, so unsigned comparison of images
// follows numeric order.
fn ordered_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let image = if bits & SIGN == 0 { bits | SIGN } else { !bits };
    image.to_be_bytes()
}

fn unordered_f64(image: u64) -> f64 {
    let bits = if image & SIGN != 0 { image ^ SIGN } else { !image };
    f64::from_bits(bits)
}

/// Serialize the ordering descriptor for catalog storage.
pub fn order_to_bytes(order: &KeyOrder) -> Result<Vec<u8>> {
    util::into_cbor_bytes(order.to_doc())
}

/// Deserialize the ordering descriptor from catalog storage.
pub fn order_from_bytes(buf: &[u8]) -> Result<KeyOrder> {
    let (doc, _) = util::from_cbor_bytes::<Doc>(buf)?;
    KeyOrder::from_doc(&doc)
}

#[cfg(test)]
#[path = "key_test.rs"]
mod key_test;
