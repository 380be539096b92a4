//! Ordered-key codec (component A): encodes integers, strings and composite
//! tuples into byte strings whose lexicographic order matches semantic
//! order, and decodes them back exactly.
//!
//! Two reserved single-byte type tags are used so encoded values never start
//! with a byte below `0x02`; every real entity or index key therefore sorts
//! after the two reserved metadata keys described in §6.

use crate::error::{CResult, Error};

const TAG_INT: u8 = 0x04;
const TAG_STR: u8 = 0x05;

/// The composite-key separator between an index key and the source id it
/// was emitted for.
pub const COMPOSITE_SEPARATOR: u8 = 0x1E;
/// One past the separator; used as an exclusive upper bound when scanning
/// all entries under a single index key.
pub const COMPOSITE_UPPER_BOUND: u8 = 0x1F;

/// A value that can be order-encoded: either a signed integer or a string.
/// Entity ids and index keys are both represented this way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OrderedValue {
    Int(i64),
    Str(String),
}

impl From<i64> for OrderedValue {
    fn from(v: i64) -> Self {
        OrderedValue::Int(v)
    }
}

impl From<u64> for OrderedValue {
    fn from(v: u64) -> Self {
        OrderedValue::Int(v as i64)
    }
}

impl From<String> for OrderedValue {
    fn from(v: String) -> Self {
        OrderedValue::Str(v)
    }
}

impl<'a> From<&'a str> for OrderedValue {
    fn from(v: &'a str) -> Self {
        OrderedValue::Str(v.to_string())
    }
}

/// Encodes a single value so that byte-wise order equals semantic order.
pub fn encode_ordered(value: &OrderedValue) -> Vec<u8> {
    match value {
        OrderedValue::Int(n) => {
            // Flipping the sign bit turns two's-complement ordering into
            // unsigned byte-order, so negative numbers sort before positive
            // ones and within each group numeric order is preserved.
            let biased = (*n as u64) ^ (1u64 << 63);
            let mut out = Vec::with_capacity(9);
            out.push(TAG_INT);
            out.extend_from_slice(&biased.to_be_bytes());
            out
        }
        OrderedValue::Str(s) => {
            let mut out = Vec::with_capacity(2 + s.len());
            out.push(TAG_STR);
            for &b in s.as_bytes() {
                if b == 0x00 {
                    out.push(0x00);
                    out.push(0xFF);
                } else {
                    out.push(b);
                }
            }
            out.push(0x00);
            out.push(0x00);
            out
        }
    }
}

/// Decodes a single value, returning the value and the number of bytes
/// consumed from the front of `bytes`.
pub fn decode_ordered_prefix(bytes: &[u8]) -> CResult<(OrderedValue, usize)> {
    let tag = *bytes.first().ok_or_else(|| Error::Codec("empty key".into()))?;
    match tag {
        TAG_INT => {
            if bytes.len() < 9 {
                return Err(Error::Codec("truncated integer key".into()));
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[1..9]);
            let biased = u64::from_be_bytes(buf);
            let n = (biased ^ (1u64 << 63)) as i64;
            Ok((OrderedValue::Int(n), 9))
        }
        TAG_STR => {
            let mut out = Vec::new();
            let mut i = 1;
            loop {
                match bytes.get(i) {
                    Some(0x00) => match bytes.get(i + 1) {
                        Some(0x00) => {
                            i += 2;
                            break;
                        }
                        Some(0xFF) => {
                            out.push(0x00);
                            i += 2;
                        }
                        _ => return Err(Error::Codec("malformed escaped string key".into())),
                    },
                    Some(&b) => {
                        out.push(b);
                        i += 1;
                    }
                    None => return Err(Error::Codec("unterminated string key".into())),
                }
            }
            let s = String::from_utf8(out).map_err(|e| Error::Codec(e.to_string()))?;
            Ok((OrderedValue::Str(s), i))
        }
        other => Err(Error::Codec(format!("unknown key tag {:#x}", other))),
    }
}

/// Decodes a value expected to span the whole slice exactly.
pub fn decode_ordered(bytes: &[u8]) -> CResult<OrderedValue> {
    let (value, consumed) = decode_ordered_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(Error::Codec("trailing bytes after key value".into()));
    }
    Ok(value)
}

/// Encodes the composite `(index_key, source_id)` key used for index rows.
pub fn encode_composite(index_key: &OrderedValue, source_id: &OrderedValue) -> Vec<u8> {
    let mut out = encode_ordered(index_key);
    out.push(COMPOSITE_SEPARATOR);
    out.extend(encode_ordered(source_id));
    out
}

/// Decodes a composite `(index_key, source_id)` key.
pub fn decode_composite(bytes: &[u8]) -> CResult<(OrderedValue, OrderedValue)> {
    let (index_key, consumed) = decode_ordered_prefix(bytes)?;
    let rest = bytes.get(consumed..).ok_or_else(|| Error::Codec("truncated composite key".into()))?;
    let (&sep, rest) = rest
        .split_first()
        .ok_or_else(|| Error::Codec("missing composite separator".into()))?;
    if sep != COMPOSITE_SEPARATOR {
        return Err(Error::Codec("expected composite separator".into()));
    }
    let source_id = decode_ordered(rest)?;
    Ok((index_key, source_id))
}

/// The exclusive upper bound covering every composite key sharing `index_key`.
pub fn composite_prefix_upper_bound(index_key: &OrderedValue) -> Vec<u8> {
    let mut out = encode_ordered(index_key);
    out.push(COMPOSITE_UPPER_BOUND);
    out
}

/// The inclusive lower bound covering every composite key sharing `index_key`.
pub fn composite_prefix_lower_bound(index_key: &OrderedValue) -> Vec<u8> {
    let mut out = encode_ordered(index_key);
    out.push(COMPOSITE_SEPARATOR);
    out
}
