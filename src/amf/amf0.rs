//! AMF0 encoder and decoder
//!
//! The marker subset used by FLV script-data payloads:
//!
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array with count hint)
//! 0x09 - Object End
//! 0x0A - Strict Array (dense array)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// Decode all values from a script-data payload.
///
/// Encoders occasionally omit the final object-end marker; a well-formed
/// prefix followed by truncation is therefore tolerated at top level.
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(decode_value(&mut buf, 0)?);
    }
    Ok(values)
}

fn decode_value(buf: &mut Bytes, depth: usize) -> Result<AmfValue, AmfError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(AmfError::NestingTooDeep);
    }
    if buf.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }
    let marker = buf.get_u8();
    match marker {
        MARKER_NUMBER => {
            if buf.remaining() < 8 {
                return Err(AmfError::UnexpectedEof);
            }
            Ok(AmfValue::Number(buf.get_f64()))
        }
        MARKER_BOOLEAN => {
            if buf.is_empty() {
                return Err(AmfError::UnexpectedEof);
            }
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
        MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
        MARKER_OBJECT => Ok(AmfValue::Object(decode_properties(buf, depth)?)),
        MARKER_ECMA_ARRAY => {
            if buf.remaining() < 4 {
                return Err(AmfError::UnexpectedEof);
            }
            // count hint, not always accurate
            let _count = buf.get_u32();
            Ok(AmfValue::EcmaArray(decode_properties(buf, depth)?))
        }
        MARKER_STRICT_ARRAY => {
            if buf.remaining() < 4 {
                return Err(AmfError::UnexpectedEof);
            }
            let count = buf.get_u32() as usize;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(decode_value(buf, depth + 1)?);
            }
            Ok(AmfValue::Array(elements))
        }
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        _ => Err(AmfError::UnknownMarker(marker)),
    }
}

fn decode_properties(
    buf: &mut Bytes,
    depth: usize,
) -> Result<BTreeMap<String, AmfValue>, AmfError> {
    let mut properties = BTreeMap::new();
    loop {
        if buf.is_empty() {
            // some encoders omit the end marker
            return Ok(properties);
        }
        let key = read_utf8(buf)?;
        if key.is_empty() {
            if buf.is_empty() {
                return Ok(properties);
            }
            let end_marker = buf.get_u8();
            if end_marker != MARKER_OBJECT_END {
                return Err(AmfError::UnknownMarker(end_marker));
            }
            return Ok(properties);
        }
        let value = decode_value(buf, depth + 1)?;
        properties.insert(key, value);
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

fn write_utf8(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

/// Encode a single value into `out`.
pub fn encode(out: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Null => {
            out.put_u8(MARKER_NULL);
        }
        AmfValue::Undefined => {
            out.put_u8(MARKER_UNDEFINED);
        }
        AmfValue::Boolean(b) => {
            out.put_u8(MARKER_BOOLEAN);
            out.put_u8(u8::from(*b));
        }
        AmfValue::Number(n) => {
            out.put_u8(MARKER_NUMBER);
            out.put_f64(*n);
        }
        AmfValue::String(s) => {
            if s.len() > 0xFFFF {
                out.put_u8(MARKER_LONG_STRING);
                out.put_u32(s.len() as u32);
            } else {
                out.put_u8(MARKER_STRING);
                out.put_u16(s.len() as u16);
            }
            out.put_slice(s.as_bytes());
        }
        AmfValue::Object(props) => {
            out.put_u8(MARKER_OBJECT);
            for (key, val) in props {
                write_utf8(out, key);
                encode(out, val);
            }
            out.put_u16(0);
            out.put_u8(MARKER_OBJECT_END);
        }
        AmfValue::EcmaArray(props) => {
            out.put_u8(MARKER_ECMA_ARRAY);
            out.put_u32(props.len() as u32);
            for (key, val) in props {
                write_utf8(out, key);
                encode(out, val);
            }
            out.put_u16(0);
            out.put_u8(MARKER_OBJECT_END);
        }
        AmfValue::Array(elements) => {
            out.put_u8(MARKER_STRICT_ARRAY);
            out.put_u32(elements.len() as u32);
            for elem in elements {
                encode(out, elem);
            }
        }
    }
}

/// Encode a sequence of values to a fresh buffer.
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    for value in values {
        encode(&mut out, value);
    }
    out.freeze()
}
