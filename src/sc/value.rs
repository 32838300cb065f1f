//! DTMI wire values
//!
//! SC packet and header bodies are serialised DTMI values, a compact
//! self-describing binary encoding:
//!
//! ```text
//! 0x01  integer   8-byte big-endian
//! 0x02  bytes     4-byte big-endian length + raw bytes
//! 0xE0  object    { 2-byte key length, key, value }* then 00 00 EE
//! 0x0A  array     value* then 00 00 EE
//! ```
//!
//! Byte strings carry media payloads and are not required to be UTF-8, so
//! they are stored as [`Bytes`]; [`Value::as_str`] only succeeds on valid
//! UTF-8 content.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::error::{ContainerError, Result};

const MARKER_INT: u8 = 0x01;
const MARKER_BYTES: u8 = 0x02;
const MARKER_OBJECT: u8 = 0xE0;
const MARKER_OBJECT_ALT: u8 = 0xFF;
const MARKER_ARRAY: u8 = 0x0A;

/// A self-describing DTMI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// 64-bit integer
    Int(i64),
    /// Raw byte string
    Bytes(Bytes),
    /// Key-ordered map
    Object(BTreeMap<String, Value>),
    /// Ordered list
    Array(Vec<Value>),
}

impl Value {
    /// Empty object, the usual starting point for building metadata.
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get a member of an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object()?.get(key)
    }

    /// Get an integer member of an object value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_int()
    }

    /// Get a UTF-8 string member of an object value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Insert into an object value; no-op on other variants.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Value::Object(m) = self {
            m.insert(key.into(), value.into());
        }
    }

    /// Serialise into `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Value::Int(v) => {
                out.put_u8(MARKER_INT);
                out.put_u64(*v as u64);
            }
            Value::Bytes(b) => {
                out.put_u8(MARKER_BYTES);
                out.put_u32(b.len() as u32);
                out.put_slice(b);
            }
            Value::Object(m) => {
                out.put_u8(MARKER_OBJECT);
                for (key, value) in m {
                    if key.is_empty() {
                        continue;
                    }
                    out.put_u16(key.len() as u16);
                    out.put_slice(key.as_bytes());
                    value.encode_into(out);
                }
                out.put_slice(&[0x00, 0x00, 0xEE]);
            }
            Value::Array(items) => {
                out.put_u8(MARKER_ARRAY);
                for item in items {
                    item.encode_into(out);
                }
                out.put_slice(&[0x00, 0x00, 0xEE]);
            }
        }
    }

    /// Serialise to a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }

    /// Decode one value from the front of `data`, returning it and the number
    /// of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Value, usize)> {
        let mut pos = 0;
        let value = decode_one(data, &mut pos)?;
        Ok((value, pos))
    }
}

fn decode_one(data: &[u8], pos: &mut usize) -> Result<Value> {
    let marker = *data.get(*pos).ok_or(ContainerError::InvalidValue)?;
    *pos += 1;
    match marker {
        MARKER_INT => {
            let end = *pos + 8;
            let raw = data.get(*pos..end).ok_or(ContainerError::InvalidValue)?;
            *pos = end;
            Ok(Value::Int(u64::from_be_bytes(raw.try_into().unwrap()) as i64))
        }
        MARKER_BYTES => {
            let raw = data
                .get(*pos..*pos + 4)
                .ok_or(ContainerError::InvalidValue)?;
            let len = u32::from_be_bytes(raw.try_into().unwrap()) as usize;
            *pos += 4;
            let end = *pos + len;
            let body = data.get(*pos..end).ok_or(ContainerError::InvalidValue)?;
            *pos = end;
            Ok(Value::Bytes(Bytes::copy_from_slice(body)))
        }
        MARKER_OBJECT | MARKER_OBJECT_ALT => {
            let mut map = BTreeMap::new();
            loop {
                let head = data
                    .get(*pos..*pos + 2)
                    .ok_or(ContainerError::InvalidValue)?;
                if head == [0x00, 0x00] {
                    // expect the EE terminator byte
                    if data.get(*pos + 2) != Some(&0xEE) {
                        return Err(ContainerError::InvalidValue.into());
                    }
                    *pos += 3;
                    return Ok(Value::Object(map));
                }
                let key_len = u16::from_be_bytes(head.try_into().unwrap()) as usize;
                *pos += 2;
                let end = *pos + key_len;
                let key_raw = data.get(*pos..end).ok_or(ContainerError::InvalidValue)?;
                let key = std::str::from_utf8(key_raw)
                    .map_err(|_| ContainerError::InvalidValue)?
                    .to_string();
                *pos = end;
                let value = decode_one(data, pos)?;
                map.insert(key, value);
            }
        }
        MARKER_ARRAY => {
            let mut items = Vec::new();
            loop {
                let head = data
                    .get(*pos..*pos + 2)
                    .ok_or(ContainerError::InvalidValue)?;
                if head == [0x00, 0x00] {
                    if data.get(*pos + 2) != Some(&0xEE) {
                        return Err(ContainerError::InvalidValue.into());
                    }
                    *pos += 3;
                    return Ok(Value::Array(items));
                }
                items.push(decode_one(data, pos)?);
            }
        }
        _ => Err(ContainerError::InvalidValue.into()),
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(Bytes::from(v.into_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        let v = Value::Int(1234567890123);
        let encoded = v.encode();
        assert_eq!(encoded[0], 0x01);
        assert_eq!(encoded.len(), 9);
        let (decoded, used) = Value::decode(&encoded).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(used, 9);
    }

    #[test]
    fn test_negative_int_roundtrip() {
        let v = Value::Int(-42);
        let (decoded, _) = Value::decode(&v.encode()).unwrap();
        assert_eq!(decoded.as_int(), Some(-42));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let v = Value::Bytes(Bytes::from_static(&[0x00, 0xFF, 0x10, b'\n']));
        let encoded = v.encode();
        assert_eq!(&encoded[..5], &[0x02, 0, 0, 0, 4]);
        let (decoded, _) = Value::decode(&encoded).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn test_object_roundtrip() {
        let mut v = Value::object();
        v.set("time", 1000i64);
        v.set("datatype", "video");
        let encoded = v.encode();
        assert_eq!(encoded[0], 0xE0);
        assert_eq!(&encoded[encoded.len() - 3..], &[0x00, 0x00, 0xEE]);
        let (decoded, used) = Value::decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded.get_int("time"), Some(1000));
        assert_eq!(decoded.get_str("datatype"), Some("video"));
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut inner = Value::object();
        inner.set("codec", "H264");
        let mut v = Value::object();
        v.set("track1", inner);
        v.set(
            "keys",
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        );
        let (decoded, _) = Value::decode(&v.encode()).unwrap();
        assert_eq!(decoded.get("track1").unwrap().get_str("codec"), Some("H264"));
        assert_eq!(decoded.get("keys").unwrap().as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut v = Value::object();
        v.set("data", Bytes::from_static(b"payload"));
        let encoded = v.encode();
        for cut in 1..encoded.len() {
            assert!(Value::decode(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn test_alt_object_marker() {
        let mut v = Value::object();
        v.set("a", 1i64);
        let mut encoded = BytesMut::from(v.encode().as_ref());
        encoded[0] = 0xFF;
        let (decoded, _) = Value::decode(&encoded).unwrap();
        assert_eq!(decoded.get_int("a"), Some(1));
    }

    #[test]
    fn test_unknown_marker_fails() {
        assert!(Value::decode(&[0x42, 0, 0]).is_err());
    }
}
