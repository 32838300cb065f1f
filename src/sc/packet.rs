//! SC packets
//!
//! One time-stamped media unit. On the wire a packet is the 4-byte magic
//! `DTSC`, a 4-byte big-endian body length, and a DTMI object body; stream
//! headers use the 8-byte magic `DTSC-hdr` with the same length + body
//! layout.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use super::value::Value;
use crate::error::{ContainerError, Result};

/// Magic bytes prefixing every data packet.
pub const PACKET_MAGIC: &[u8; 4] = b"DTSC";
/// Magic bytes prefixing every stream header.
pub const HEADER_MAGIC: &[u8; 8] = b"DTSC-hdr";

/// Packet content kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Audio,
    Video,
    Meta,
    PauseMark,
    ModifiedHeader,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Audio => "audio",
            Kind::Video => "video",
            Kind::Meta => "meta",
            Kind::PauseMark => "pause_marker",
            Kind::ModifiedHeader => "modifiedheader",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Kind::Audio),
            "video" => Some(Kind::Video),
            "meta" => Some(Kind::Meta),
            "pause_marker" => Some(Kind::PauseMark),
            "modifiedheader" => Some(Kind::ModifiedHeader),
            _ => None,
        }
    }
}

/// NALU marker carried by H.264 video packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluFlag {
    /// One or more NAL units.
    Unit,
    /// End-of-sequence marker.
    EndOfSequence,
}

/// One time-stamped media unit.
#[derive(Debug, Clone)]
pub struct Packet {
    pub track_id: u32,
    pub timestamp_ms: u64,
    pub kind: Kind,
    /// Opaque media payload (empty for metadata packets).
    pub payload: Bytes,
    pub keyframe: bool,
    pub interframe: bool,
    pub disposable: bool,
    pub nalu: Option<NaluFlag>,
    /// Signed 24-bit composition time offset.
    pub offset: Option<i32>,
    /// Extra key/value content of metadata packets.
    pub data: BTreeMap<String, Value>,
}

impl Packet {
    pub fn new(kind: Kind, track_id: u32, timestamp_ms: u64, payload: Bytes) -> Self {
        Self {
            track_id,
            timestamp_ms,
            kind,
            payload,
            keyframe: false,
            interframe: false,
            disposable: false,
            nalu: None,
            offset: None,
            data: BTreeMap::new(),
        }
    }

    /// Build from a decoded DTMI body.
    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value
            .get_str("datatype")
            .and_then(Kind::from_str)
            .ok_or(ContainerError::MissingField("datatype"))?;
        let timestamp_ms = value
            .get_int("time")
            .ok_or(ContainerError::MissingField("time"))? as u64;
        let track_id = value.get_int("trackid").unwrap_or(0) as u32;

        let mut packet = Packet::new(kind, track_id, timestamp_ms, Bytes::new());
        packet.keyframe = value.get_int("keyframe").unwrap_or(0) != 0;
        packet.interframe = value.get_int("interframe").unwrap_or(0) != 0;
        packet.disposable = value.get_int("disposableframe").unwrap_or(0) != 0;
        if value.get_int("nalu").unwrap_or(0) != 0 {
            packet.nalu = Some(NaluFlag::Unit);
        } else if value.get_int("nalu_end").unwrap_or(0) != 0 {
            packet.nalu = Some(NaluFlag::EndOfSequence);
        }
        if let Some(offset) = value.get_int("offset") {
            packet.offset = Some(offset as i32);
        }
        match value.get("data") {
            Some(Value::Bytes(b)) => packet.payload = b.clone(),
            Some(Value::Object(m)) => packet.data = m.clone(),
            _ => {}
        }
        Ok(packet)
    }

    /// Serialise to a DTMI body.
    pub fn to_value(&self) -> Value {
        let mut v = Value::object();
        v.set("datatype", self.kind.as_str());
        v.set("trackid", self.track_id as i64);
        v.set("time", self.timestamp_ms as i64);
        if self.keyframe {
            v.set("keyframe", 1i64);
        }
        if self.interframe {
            v.set("interframe", 1i64);
        }
        if self.disposable {
            v.set("disposableframe", 1i64);
        }
        match self.nalu {
            Some(NaluFlag::Unit) => v.set("nalu", 1i64),
            Some(NaluFlag::EndOfSequence) => v.set("nalu_end", 1i64),
            None => {}
        }
        if let Some(offset) = self.offset {
            v.set("offset", offset as i64);
        }
        if self.kind == Kind::Meta && !self.data.is_empty() {
            v.set("data", Value::Object(self.data.clone()));
        } else if !self.payload.is_empty() || self.kind != Kind::Meta {
            v.set("data", self.payload.clone());
        }
        v
    }

    /// Serialise to wire form: magic + length + body.
    pub fn encode(&self) -> Bytes {
        frame_packet(&self.to_value())
    }
}

/// Wrap a value body in packet framing.
pub fn frame_packet(body: &Value) -> Bytes {
    let encoded = body.encode();
    let mut out = BytesMut::with_capacity(8 + encoded.len());
    out.put_slice(PACKET_MAGIC);
    out.put_u32(encoded.len() as u32);
    out.put_slice(&encoded);
    out.freeze()
}

/// Wrap a value body in header framing.
pub fn frame_header(body: &Value) -> Bytes {
    let encoded = body.encode();
    let mut out = BytesMut::with_capacity(12 + encoded.len());
    out.put_slice(HEADER_MAGIC);
    out.put_u32(encoded.len() as u32);
    out.put_slice(&encoded);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_packet_roundtrip() {
        let mut packet = Packet::new(
            Kind::Video,
            1,
            4200,
            Bytes::from_static(&[0x65, 0x88, 0x01]),
        );
        packet.keyframe = true;
        packet.nalu = Some(NaluFlag::Unit);
        packet.offset = Some(-40);

        let parsed = Packet::from_value(&packet.to_value()).unwrap();
        assert_eq!(parsed.kind, Kind::Video);
        assert_eq!(parsed.track_id, 1);
        assert_eq!(parsed.timestamp_ms, 4200);
        assert!(parsed.keyframe);
        assert!(!parsed.interframe);
        assert_eq!(parsed.nalu, Some(NaluFlag::Unit));
        assert_eq!(parsed.offset, Some(-40));
        assert_eq!(parsed.payload.as_ref(), &[0x65, 0x88, 0x01]);
    }

    #[test]
    fn test_meta_packet_carries_data_map() {
        let mut packet = Packet::new(Kind::Meta, 3, 0, Bytes::new());
        packet.data.insert("encoder".into(), Value::from("obs"));
        packet.data.insert("duration".into(), Value::Int(60));

        let parsed = Packet::from_value(&packet.to_value()).unwrap();
        assert_eq!(parsed.kind, Kind::Meta);
        assert_eq!(parsed.data.get("encoder").and_then(Value::as_str), Some("obs"));
        assert_eq!(parsed.data.get("duration").and_then(Value::as_int), Some(60));
    }

    #[test]
    fn test_missing_datatype_rejected() {
        let mut v = Value::object();
        v.set("time", 100i64);
        assert!(Packet::from_value(&v).is_err());
    }

    #[test]
    fn test_wire_framing() {
        let packet = Packet::new(Kind::Audio, 2, 20, Bytes::from_static(b"aac"));
        let wire = packet.encode();
        assert_eq!(&wire[..4], PACKET_MAGIC);
        let len = u32::from_be_bytes(wire[4..8].try_into().unwrap()) as usize;
        assert_eq!(wire.len(), 8 + len);
        let (body, _) = Value::decode(&wire[8..]).unwrap();
        let parsed = Packet::from_value(&body).unwrap();
        assert_eq!(parsed.track_id, 2);
        assert_eq!(parsed.payload.as_ref(), b"aac");
    }

    #[test]
    fn test_header_framing() {
        let mut body = Value::object();
        body.set("lastms", 1000i64);
        let wire = frame_header(&body);
        assert_eq!(&wire[..8], HEADER_MAGIC);
        let len = u32::from_be_bytes(wire[8..12].try_into().unwrap()) as usize;
        assert_eq!(wire.len(), 12 + len);
    }
}
