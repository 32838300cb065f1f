//! Stream and track metadata
//!
//! A stream header carries one [`TrackMeta`] per track plus a global
//! timeline. Fixed (on-disk) streams additionally carry a per-track key
//! index used for seeking and for planning the MP4 interleave.
//!
//! Historical recordings spell a couple of fields inconsistently
//! (`firsms` for `firstms`, `fkps` for `fpks`); reads accept both spellings
//! and warn, writes always emit the canonical one.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

use super::value::Value;

/// Track content kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "video" => Some(TrackKind::Video),
            "audio" => Some(TrackKind::Audio),
            _ => None,
        }
    }
}

/// One entry of a fixed stream's key index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Media time of the keyframe.
    pub time_ms: u64,
    /// Byte position of the keyframe's packet in the file.
    pub byte_pos: u64,
    /// Duration covered until the next key.
    pub length_ms: u64,
    /// Total payload bytes of all parts under this key.
    pub byte_size: u64,
    /// Number of media parts under this key.
    pub part_count: u32,
    /// Part sizes in the 16-bit continuation encoding.
    pub encoded_part_sizes: Bytes,
}

impl KeyEntry {
    /// Decoded part sizes, in order.
    pub fn part_sizes(&self) -> Vec<u64> {
        decode_sizes(&self.encoded_part_sizes)
    }
}

/// Encode part sizes: 16-bit big-endian per part, with `0xFFFF` meaning
/// "add 65535 and continue into the next pair".
pub fn encode_sizes(sizes: &[u64]) -> Bytes {
    let mut out = BytesMut::with_capacity(sizes.len() * 2);
    for &size in sizes {
        let mut rest = size;
        while rest >= 0xFFFF {
            out.extend_from_slice(&[0xFF, 0xFF]);
            rest -= 0xFFFF;
        }
        out.extend_from_slice(&[(rest >> 8) as u8, (rest & 0xFF) as u8]);
    }
    out.freeze()
}

/// Inverse of [`encode_sizes`].
pub fn decode_sizes(encoded: &[u8]) -> Vec<u64> {
    let mut out = Vec::new();
    let mut acc: u64 = 0;
    for pair in encoded.chunks_exact(2) {
        let cur = ((pair[0] as u64) << 8) | pair[1] as u64;
        acc += cur;
        if cur != 0xFFFF {
            out.push(acc);
            acc = 0;
        }
    }
    out
}

/// Per-track metadata.
#[derive(Debug, Clone, Default)]
pub struct TrackMeta {
    pub track_id: u32,
    pub kind: Option<TrackKind>,
    /// Symbolic codec name: "H264", "H263", "VP6", "AAC", "MP3", ...
    pub codec: String,
    /// Codec-private init bytes (SPS/PPS record, AudioSpecificConfig).
    pub init: Bytes,
    // video
    pub width: u32,
    pub height: u32,
    /// Frames per 1000 seconds.
    pub fpks: u32,
    // audio
    /// Sample rate in Hz.
    pub rate: u32,
    /// Bits per sample.
    pub size: u32,
    pub channels: u32,
    /// Bytes per second.
    pub bps: u32,
    pub first_ms: u64,
    pub last_ms: u64,
    /// Key index; populated for fixed streams only.
    pub keys: Vec<KeyEntry>,
}

impl TrackMeta {
    pub fn new(track_id: u32, kind: TrackKind) -> Self {
        Self {
            track_id,
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Total number of media parts across the key index.
    pub fn total_parts(&self) -> u64 {
        self.keys.iter().map(|k| k.part_count as u64).sum()
    }

    pub fn from_value(value: &Value) -> Self {
        let mut track = TrackMeta {
            track_id: value.get_int("trackid").unwrap_or(0) as u32,
            kind: value.get_str("type").and_then(TrackKind::from_str),
            codec: value.get_str("codec").unwrap_or_default().to_string(),
            init: value
                .get("init")
                .and_then(Value::as_bytes)
                .cloned()
                .unwrap_or_default(),
            width: value.get_int("width").unwrap_or(0) as u32,
            height: value.get_int("height").unwrap_or(0) as u32,
            fpks: value.get_int("fpks").unwrap_or(0) as u32,
            rate: value.get_int("rate").unwrap_or(0) as u32,
            size: value.get_int("size").unwrap_or(0) as u32,
            channels: value.get_int("channels").unwrap_or(0) as u32,
            bps: value.get_int("bps").unwrap_or(0) as u32,
            first_ms: value.get_int("firstms").unwrap_or(0) as u64,
            last_ms: value.get_int("lastms").unwrap_or(0) as u64,
            keys: Vec::new(),
        };
        // legacy spellings from old recordings
        if track.first_ms == 0 {
            if let Some(v) = value.get_int("firsms") {
                tracing::warn!(track = track.track_id, "metadata uses legacy spelling 'firsms'");
                track.first_ms = v as u64;
            }
        }
        if track.fpks == 0 {
            if let Some(v) = value.get_int("fkps") {
                tracing::warn!(track = track.track_id, "metadata uses legacy spelling 'fkps'");
                track.fpks = v as u32;
            }
        }
        if let Some(keys) = value.get("keys").and_then(Value::as_array) {
            for key in keys {
                track.keys.push(KeyEntry {
                    time_ms: key.get_int("time").unwrap_or(0) as u64,
                    byte_pos: key.get_int("bpos").unwrap_or(0) as u64,
                    length_ms: key.get_int("len").unwrap_or(0) as u64,
                    byte_size: key.get_int("size").unwrap_or(0) as u64,
                    part_count: key.get_int("partsize").unwrap_or(0) as u32,
                    encoded_part_sizes: key
                        .get("parts")
                        .and_then(Value::as_bytes)
                        .cloned()
                        .unwrap_or_default(),
                });
            }
        }
        track
    }

    pub fn to_value(&self) -> Value {
        let mut v = Value::object();
        v.set("trackid", self.track_id as i64);
        if let Some(kind) = self.kind {
            v.set("type", kind.as_str());
        }
        if !self.codec.is_empty() {
            v.set("codec", self.codec.as_str());
        }
        if !self.init.is_empty() {
            v.set("init", self.init.clone());
        }
        match self.kind {
            Some(TrackKind::Video) => {
                v.set("width", self.width as i64);
                v.set("height", self.height as i64);
                v.set("fpks", self.fpks as i64);
            }
            Some(TrackKind::Audio) => {
                v.set("rate", self.rate as i64);
                v.set("size", self.size as i64);
                v.set("channels", self.channels as i64);
            }
            None => {}
        }
        v.set("bps", self.bps as i64);
        v.set("firstms", self.first_ms as i64);
        v.set("lastms", self.last_ms as i64);
        if !self.keys.is_empty() {
            let mut keys = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                let mut kv = Value::object();
                kv.set("time", key.time_ms as i64);
                kv.set("bpos", key.byte_pos as i64);
                kv.set("len", key.length_ms as i64);
                kv.set("size", key.byte_size as i64);
                kv.set("partsize", key.part_count as i64);
                kv.set("parts", key.encoded_part_sizes.clone());
                keys.push(kv);
            }
            v.set("keys", Value::Array(keys));
        }
        v
    }
}

/// Whole-stream metadata: track map plus the global timeline.
#[derive(Debug, Clone, Default)]
pub struct StreamMeta {
    pub tracks: BTreeMap<u32, TrackMeta>,
    pub first_ms: u64,
    pub last_ms: u64,
    pub length_ms: u64,
    /// Set on live streams; fixed files clear it.
    pub live: bool,
}

impl StreamMeta {
    pub fn has_video(&self) -> bool {
        self.tracks
            .values()
            .any(|t| t.kind == Some(TrackKind::Video))
    }

    pub fn has_audio(&self) -> bool {
        self.tracks
            .values()
            .any(|t| t.kind == Some(TrackKind::Audio))
    }

    /// Track ids of all video tracks.
    pub fn video_tracks(&self) -> Vec<u32> {
        self.tracks
            .values()
            .filter(|t| t.kind == Some(TrackKind::Video))
            .map(|t| t.track_id)
            .collect()
    }

    pub fn track(&self, track_id: u32) -> Option<&TrackMeta> {
        self.tracks.get(&track_id)
    }

    /// Get-or-create a track record, keeping its id consistent.
    pub fn track_mut(&mut self, track_id: u32, kind: TrackKind) -> &mut TrackMeta {
        self.tracks
            .entry(track_id)
            .or_insert_with(|| TrackMeta::new(track_id, kind))
    }

    pub fn from_value(value: &Value) -> Self {
        let mut meta = StreamMeta {
            first_ms: value.get_int("firstms").unwrap_or(0) as u64,
            last_ms: value.get_int("lastms").unwrap_or(0) as u64,
            length_ms: value.get_int("lengthms").unwrap_or(0) as u64,
            live: value.get_int("live").unwrap_or(0) != 0,
            tracks: BTreeMap::new(),
        };
        if let Some(tracks) = value.get("tracks").and_then(Value::as_object) {
            for track_value in tracks.values() {
                let track = TrackMeta::from_value(track_value);
                meta.tracks.insert(track.track_id, track);
            }
        }
        meta
    }

    pub fn to_value(&self) -> Value {
        let mut v = Value::object();
        let mut tracks = Value::object();
        for track in self.tracks.values() {
            tracks.set(format!("track{}", track.track_id), track.to_value());
        }
        v.set("tracks", tracks);
        v.set("firstms", self.first_ms as i64);
        v.set("lastms", self.last_ms as i64);
        v.set("lengthms", self.length_ms as i64);
        if self.live {
            v.set("live", 1i64);
        }
        v
    }
}
