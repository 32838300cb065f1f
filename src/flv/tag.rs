//! FLV tag loading, classification and SC translation
//!
//! A tag owns a growable byte buffer holding the full wire form:
//!
//! ```text
//! +--------+-------------+-----------+-------------+---------+------------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Body(N) | PrevSize(4)|
//! +--------+-------------+-----------+-------------+---------+------------+
//! ```
//!
//! `len` is the wire length of the current tag; the buffer may be larger so
//! allocations are reused across tags. The incremental loader consumes from
//! a [`Buffer`] in two phases (header, then body) and also recognises the
//! 13-byte FLV container header, which is validated and stashed crate-wide.

use bytes::Buf;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::codec::{
    sample_rate_bits, sample_rate_from_byte, AudioCodec, VideoCodec,
};
use crate::amf::{self, AmfValue};
use crate::error::{MediaError, Result};
use crate::net::Buffer;
use crate::sc::meta::{StreamMeta, TrackKind, TrackMeta};
use crate::sc::packet::{Kind, NaluFlag, Packet};
use crate::sc::value::Value;

/// Track id assigned to FLV video data.
pub const VIDEO_TRACK: u32 = 1;
/// Track id assigned to FLV audio data.
pub const AUDIO_TRACK: u32 = 2;
/// Track id assigned to packets derived from script-data tags.
pub const META_TRACK: u32 = 3;

/// The last container header seen by any loader, defaulting to an
/// audio+video FLV version 1 header.
static LAST_HEADER: Mutex<[u8; 13]> = Mutex::new([
    b'F', b'L', b'V', 0x01, 0x05, 0, 0, 0, 0x09, 0, 0, 0, 0,
]);

/// The most recently parsed container header.
pub fn last_header() -> [u8; 13] {
    *LAST_HEADER.lock().unwrap()
}

fn store_header(header: [u8; 13]) {
    *LAST_HEADER.lock().unwrap() = header;
}

/// Check the first 3 bytes for the container magic "FLV".
pub fn is_header(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == b'F' && data[1] == b'L' && data[2] == b'V'
}

/// Validate a 13-byte container header: magic, DataOffset 9, zero initial
/// PreviousTagSize. The version and flags bytes may vary.
pub fn check_header(header: &[u8]) -> bool {
    header.len() >= 13
        && is_header(header)
        && header[5] == 0
        && header[6] == 0
        && header[7] == 0
        && header[8] == 0x09
        && header[9] == 0
        && header[10] == 0
        && header[11] == 0
        && header[12] == 0
}

/// Tag content kind, from the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Audio,
    Video,
    Script,
}

/// A single FLV tag with its incremental loader state.
#[derive(Debug)]
pub struct Tag {
    /// Wire bytes; only `data[..len]` is meaningful.
    data: Vec<u8>,
    /// Wire length of the current tag.
    len: usize,
    /// True if the current tag is a video keyframe.
    pub is_keyframe: bool,
    /// Loader phase: true while (re)reading a tag header.
    done: bool,
    /// Bytes accumulated for the current phase.
    sofar: usize,
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

impl Tag {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            len: 0,
            is_keyframe: false,
            done: true,
            sofar: 0,
        }
    }

    /// The tag's wire bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Wire length of the tag.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> Option<TagKind> {
        match self.data.first() {
            Some(&0x08) => Some(TagKind::Audio),
            Some(&0x09) => Some(TagKind::Video),
            Some(&0x12) => Some(TagKind::Script),
            _ => None,
        }
    }

    /// Grow the buffer to hold `len` bytes. On allocation failure the length
    /// is clamped to the existing capacity and nothing is written.
    fn ensure_size(&mut self) -> Result<()> {
        if self.data.len() < self.len {
            let additional = self.len - self.data.len();
            if self.data.try_reserve(additional).is_err() {
                self.len = self.data.len();
                return Err(MediaError::BufferExhausted.into());
            }
            self.data.resize(self.len, 0);
        }
        Ok(())
    }

    /// Accumulate bytes from `buffer` until `count` are present.
    fn fill_from(&mut self, buffer: &mut Buffer, count: usize) -> bool {
        while self.sofar < count {
            if buffer.size() == 0 {
                return false;
            }
            let front = buffer.get();
            let take = front.len().min(count - self.sofar);
            if take == 0 {
                return false;
            }
            self.data[self.sofar..self.sofar + take].copy_from_slice(&front[..take]);
            front.advance(take);
            self.sofar += take;
        }
        true
    }

    /// Advance the loader with whatever `buffer` holds.
    ///
    /// Returns `Ok(true)` exactly when a complete tag has been read. A
    /// container header is consumed, validated and stored without producing
    /// a tag. Errors are sticky in the sense that the byte stream is no
    /// longer tag-aligned; callers should drop the connection.
    pub fn load_from(&mut self, buffer: &mut Buffer) -> Result<bool> {
        if self.len < 15 {
            self.len = 15;
        }
        self.ensure_size()?;
        loop {
            if self.done {
                if !self.fill_from(buffer, 11) {
                    return Ok(false);
                }
                if is_header(&self.data[..3]) {
                    if !self.fill_from(buffer, 13) {
                        return Ok(false);
                    }
                    if !check_header(&self.data[..13]) {
                        return Err(MediaError::InvalidFlvHeader.into());
                    }
                    store_header(self.data[..13].try_into().unwrap());
                    self.sofar = 0;
                    continue;
                }
                self.len = self.data[3] as usize
                    + ((self.data[2] as usize) << 8)
                    + ((self.data[1] as usize) << 16)
                    + 15;
                self.ensure_size()?;
                if self.data[0] > 0x12 {
                    // bump the byte out of the valid range so a re-parse of
                    // the same buffer cannot mistake it for a fresh tag
                    self.data[0] = self.data[0].wrapping_add(32);
                    return Err(MediaError::InvalidTagType(self.data[0]).into());
                }
                self.done = false;
            } else {
                if !self.fill_from(buffer, self.len) {
                    return Ok(false);
                }
                self.is_keyframe = self.data[0] == 0x09 && (self.data[11] & 0xF0) >> 4 == 1;
                self.done = true;
                self.sofar = 0;
                return Ok(true);
            }
        }
    }

    /// The 32-bit timestamp, packed with the high byte trailing the low 24.
    pub fn timestamp(&self) -> u32 {
        ((self.data[4] as u32) << 16)
            | ((self.data[5] as u32) << 8)
            | (self.data[6] as u32)
            | ((self.data[7] as u32) << 24)
    }

    pub fn set_timestamp(&mut self, t: u32) {
        self.data[4] = ((t >> 16) & 0xFF) as u8;
        self.data[5] = ((t >> 8) & 0xFF) as u8;
        self.data[6] = (t & 0xFF) as u8;
        self.data[7] = ((t >> 24) & 0xFF) as u8;
    }

    /// Signed 24-bit composition time offset of an H.264 tag.
    pub fn offset(&self) -> i32 {
        let raw = ((self.data[13] as i32) << 16) | ((self.data[14] as i32) << 8) | self.data[15] as i32;
        (raw << 8) >> 8
    }

    pub fn set_offset(&mut self, offset: i32) {
        self.data[13] = ((offset >> 16) & 0xFF) as u8;
        self.data[14] = ((offset >> 8) & 0xFF) as u8;
        self.data[15] = (offset & 0xFF) as u8;
    }

    /// Write the previous-tag-size trailer for the current length.
    fn set_len(&mut self) {
        let prev = (self.len - 4) as u32;
        self.data[self.len - 4..self.len].copy_from_slice(&prev.to_be_bytes());
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        if self.data.first() == Some(&0x09) && self.len > 11 {
            VideoCodec::from_byte(self.data[11])
        } else {
            None
        }
    }

    pub fn audio_codec(&self) -> Option<AudioCodec> {
        if self.data.first() == Some(&0x08) && self.len > 11 {
            AudioCodec::from_byte(self.data[11])
        } else {
            None
        }
    }

    /// True if this media type requires codec init data before any frame:
    /// H263 or H264 video, AAC audio.
    pub fn needs_init_data(&self) -> bool {
        if self.len <= 11 {
            return false;
        }
        match self.data[0] {
            0x09 => matches!(self.data[11] & 0x0F, 2 | 7),
            0x08 => self.data[11] & 0xF0 == 0xA0,
            _ => false,
        }
    }

    /// True if this tag carries init data: a video-info frame, an H.264
    /// sequence header, or an AAC sequence header.
    pub fn is_init_data(&self) -> bool {
        if self.len <= 12 {
            return false;
        }
        match self.data[0] {
            0x09 => {
                if self.data[11] & 0xF0 == 0x50 {
                    return true;
                }
                self.data[11] & 0x0F == 7 && self.data[12] == 0
            }
            0x08 => self.data[11] & 0xF0 == 0xA0 && self.data[12] == 0,
            _ => false,
        }
    }

    /// Translate this tag to an SC packet, updating track metadata as a
    /// side effect. Init-data tags and video-info frames update `meta` and
    /// return `None`.
    pub fn to_packet(&self, meta: &mut StreamMeta) -> Option<Packet> {
        match *self.data.first()? {
            0x12 => self.script_to_packet(meta),
            0x08 => self.audio_to_packet(meta),
            0x09 => self.video_to_packet(meta),
            _ => None,
        }
    }

    fn script_to_packet(&self, meta: &mut StreamMeta) -> Option<Packet> {
        let body = &self.data[11..self.len - 4];
        let values = match amf::decode_all(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable script data");
                return None;
            }
        };
        // onMetaData is usually the first value, with the payload second;
        // some muxers prepend a SetDataFrame string
        let payload = if values.first().and_then(AmfValue::as_str) == Some("onMetaData") {
            values.get(1)
        } else if values.get(1).and_then(AmfValue::as_str) == Some("onMetaData") {
            values.get(2)
        } else {
            None
        }?;
        let props = payload.as_object()?;

        if let Some(codec) = props.get("videocodecid") {
            let name = match codec {
                AmfValue::Number(n) => match *n as u32 {
                    2 => "H263",
                    4 => "VP6",
                    7 => "H264",
                    _ => "?",
                },
                AmfValue::String(s) if s == "avc1" => "H264",
                _ => "?",
            };
            meta.track_mut(VIDEO_TRACK, TrackKind::Video).codec = name.to_string();
        }
        if let Some(codec) = props.get("audiocodecid") {
            let name = match codec {
                AmfValue::Number(n) => match *n as u32 {
                    2 => "MP3",
                    10 => "AAC",
                    _ => "?",
                },
                AmfValue::String(s) if s == "mp4a" => "AAC",
                AmfValue::String(s) if s == "mp3" => "MP3",
                _ => "?",
            };
            meta.track_mut(AUDIO_TRACK, TrackKind::Audio).codec = name.to_string();
        }
        if let Some(width) = props.get("width").and_then(AmfValue::as_number) {
            meta.track_mut(VIDEO_TRACK, TrackKind::Video).width = width as u32;
        }
        if let Some(height) = props.get("height").and_then(AmfValue::as_number) {
            meta.track_mut(VIDEO_TRACK, TrackKind::Video).height = height as u32;
        }
        if let Some(rate) = props.get("framerate").and_then(AmfValue::as_number) {
            meta.track_mut(VIDEO_TRACK, TrackKind::Video).fpks = (rate * 1000.0).round() as u32;
        }
        if let Some(rate) = props.get("videodatarate").and_then(AmfValue::as_number) {
            meta.track_mut(VIDEO_TRACK, TrackKind::Video).bps = (rate * 1024.0) as u32 / 8;
        }
        if let Some(rate) = props.get("audiodatarate").and_then(AmfValue::as_number) {
            meta.track_mut(AUDIO_TRACK, TrackKind::Audio).bps = (rate * 1024.0) as u32 / 8;
        }
        if let Some(rate) = props.get("audiosamplerate").and_then(AmfValue::as_number) {
            meta.track_mut(AUDIO_TRACK, TrackKind::Audio).rate = rate as u32;
        }
        if let Some(size) = props.get("audiosamplesize").and_then(AmfValue::as_number) {
            meta.track_mut(AUDIO_TRACK, TrackKind::Audio).size = size as u32;
        }
        if let Some(stereo) = props.get("stereo") {
            let stereo = stereo.as_bool().unwrap_or(stereo.as_number() == Some(1.0));
            meta.track_mut(AUDIO_TRACK, TrackKind::Audio).channels =
                if stereo { 2 } else { 1 };
        }

        const CONSUMED: [&str; 10] = [
            "videocodecid",
            "audiocodecid",
            "width",
            "height",
            "framerate",
            "videodatarate",
            "audiodatarate",
            "audiosamplerate",
            "audiosamplesize",
            "audiochannels",
        ];
        let mut data = BTreeMap::new();
        for (key, value) in props {
            if CONSUMED.contains(&key.as_str()) {
                continue;
            }
            match value {
                AmfValue::Number(n) if *n != 0.0 => {
                    data.insert(key.clone(), Value::Int(*n as i64));
                }
                AmfValue::Boolean(true) => {
                    data.insert(key.clone(), Value::Int(1));
                }
                AmfValue::String(s) if !s.is_empty() => {
                    data.insert(key.clone(), Value::from(s.as_str()));
                }
                _ => {}
            }
        }
        if data.is_empty() {
            return None;
        }
        let mut packet = Packet::new(Kind::Meta, META_TRACK, self.timestamp() as u64, Default::default());
        packet.data = data;
        Some(packet)
    }

    fn audio_to_packet(&self, meta: &mut StreamMeta) -> Option<Packet> {
        let bits = self.data[11];
        if self.needs_init_data() && self.is_init_data() {
            let init = if bits & 0xF0 == 0xA0 {
                self.data.get(13..self.len - 4)?
            } else {
                self.data.get(12..self.len - 4)?
            };
            let codec = self.audio_codec().map(|c| c.name()).unwrap_or("?");
            let track = meta.track_mut(AUDIO_TRACK, TrackKind::Audio);
            track.codec = codec.to_string();
            track.init = bytes::Bytes::copy_from_slice(init);
            return None;
        }

        let track = meta.track_mut(AUDIO_TRACK, TrackKind::Audio);
        if track.codec.is_empty() || track.codec == "?" {
            track.codec = self
                .audio_codec()
                .map(|c| c.name())
                .unwrap_or("?")
                .to_string();
        }
        if track.rate < 1 {
            track.rate = sample_rate_from_byte(bits);
        }
        if track.size < 1 {
            track.size = if bits & 0x02 != 0 { 16 } else { 8 };
        }
        if track.channels < 1 {
            track.channels = if bits & 0x01 != 0 { 2 } else { 1 };
        }

        let payload = if bits & 0xF0 == 0xA0 {
            if self.len < 18 {
                return None;
            }
            &self.data[13..self.len - 4]
        } else {
            if self.len < 17 {
                return None;
            }
            &self.data[12..self.len - 4]
        };
        Some(Packet::new(
            Kind::Audio,
            AUDIO_TRACK,
            self.timestamp() as u64,
            bytes::Bytes::copy_from_slice(payload),
        ))
    }

    fn video_to_packet(&self, meta: &mut StreamMeta) -> Option<Packet> {
        let bits = self.data[11];
        if self.needs_init_data() && self.is_init_data() {
            let init = if bits & 0x0F == 7 {
                if self.len < 21 {
                    return None;
                }
                &self.data[16..self.len - 4]
            } else {
                if self.len < 17 {
                    return None;
                }
                &self.data[12..self.len - 4]
            };
            let codec = self.video_codec().map(|c| c.name()).unwrap_or("?");
            let track = meta.track_mut(VIDEO_TRACK, TrackKind::Video);
            track.codec = codec.to_string();
            track.init = bytes::Bytes::copy_from_slice(init);
            return None;
        }

        let track = meta.track_mut(VIDEO_TRACK, TrackKind::Video);
        if track.codec.is_empty() || track.codec == "?" {
            track.codec = self
                .video_codec()
                .map(|c| c.name())
                .unwrap_or("?")
                .to_string();
        }

        let mut packet = Packet::new(Kind::Video, VIDEO_TRACK, self.timestamp() as u64, Default::default());
        match bits & 0xF0 {
            0x10 | 0x40 => packet.keyframe = true,
            0x20 => packet.interframe = true,
            0x30 => packet.disposable = true,
            // video info frames carry nothing a decoder needs
            0x50 => return None,
            _ => {}
        }
        if bits & 0x0F == 7 {
            match self.data[12] {
                1 => packet.nalu = Some(NaluFlag::Unit),
                2 => packet.nalu = Some(NaluFlag::EndOfSequence),
                _ => {}
            }
            packet.offset = Some(self.offset());
            if self.len < 21 {
                return None;
            }
            packet.payload = bytes::Bytes::copy_from_slice(&self.data[16..self.len - 4]);
        } else {
            if self.len < 17 {
                return None;
            }
            packet.payload = bytes::Bytes::copy_from_slice(&self.data[12..self.len - 4]);
        }
        Some(packet)
    }

    fn finish_tag(&mut self, tag_type: u8, timestamp: u32) {
        self.data[0] = tag_type;
        self.data[1] = (((self.len - 15) >> 16) & 0xFF) as u8;
        self.data[2] = (((self.len - 15) >> 8) & 0xFF) as u8;
        self.data[3] = ((self.len - 15) & 0xFF) as u8;
        self.data[8] = 0;
        self.data[9] = 0;
        self.data[10] = 0;
        self.set_len();
        self.set_timestamp(timestamp);
        self.done = true;
        self.sofar = 0;
    }

    /// Serialise an SC packet into this tag, reusing the buffer.
    pub fn from_packet(&mut self, packet: &Packet, meta: &StreamMeta) -> Result<()> {
        let codec = meta
            .track(packet.track_id)
            .map(|t| t.codec.as_str())
            .unwrap_or("");
        match packet.kind {
            Kind::Video => {
                self.len = packet.payload.len() + 16;
                if codec == "H264" {
                    self.len += 4;
                }
                self.ensure_size()?;
                if self.len == packet.payload.len() + 16 {
                    self.data[12..12 + packet.payload.len()].copy_from_slice(&packet.payload);
                } else {
                    self.data[16..16 + packet.payload.len()].copy_from_slice(&packet.payload);
                    self.data[12] = match packet.nalu {
                        Some(NaluFlag::Unit) => 1,
                        _ => 2,
                    };
                    self.set_offset(packet.offset.unwrap_or(0));
                }
                self.data[11] = 0;
                if codec == "H264" {
                    self.data[11] += 7;
                }
                if codec == "H263" {
                    self.data[11] += 2;
                }
                if packet.keyframe {
                    self.data[11] += 0x10;
                }
                if packet.interframe {
                    self.data[11] += 0x20;
                }
                if packet.disposable {
                    self.data[11] += 0x30;
                }
                self.is_keyframe = packet.keyframe;
                self.finish_tag(0x09, packet.timestamp_ms as u32);
            }
            Kind::Audio => {
                self.len = packet.payload.len() + 16;
                if codec == "AAC" {
                    self.len += 1;
                }
                self.ensure_size()?;
                if self.len == packet.payload.len() + 16 {
                    self.data[12..12 + packet.payload.len()].copy_from_slice(&packet.payload);
                } else {
                    self.data[13..13 + packet.payload.len()].copy_from_slice(&packet.payload);
                    // raw AAC frame, not a sequence header
                    self.data[12] = 1;
                }
                let track = meta.track(packet.track_id);
                self.data[11] = audio_format_bits(codec, track);
                self.is_keyframe = false;
                self.finish_tag(0x08, packet.timestamp_ms as u32);
            }
            Kind::Meta => {
                let mut props = BTreeMap::new();
                for (key, value) in &packet.data {
                    match value {
                        Value::Int(n) => {
                            props.insert(key.clone(), AmfValue::Number(*n as f64));
                        }
                        other => {
                            if let Some(s) = other.as_str() {
                                props.insert(key.clone(), AmfValue::String(s.to_string()));
                            }
                        }
                    }
                }
                let body = amf::encode_all(&[
                    AmfValue::String("onMetaData".into()),
                    AmfValue::EcmaArray(props),
                ]);
                self.len = body.len() + 15;
                self.ensure_size()?;
                self.data[11..11 + body.len()].copy_from_slice(&body);
                self.is_keyframe = false;
                self.finish_tag(0x12, packet.timestamp_ms as u32);
            }
            Kind::PauseMark | Kind::ModifiedHeader => {
                // nothing to express in FLV
                self.len = 0;
            }
        }
        Ok(())
    }

    /// Build the video init-data tag (H.264 sequence header) for a track.
    pub fn video_init(&mut self, track: &TrackMeta) -> Result<()> {
        // unknown codec on a video track is overwhelmingly H.264
        let codec = if track.codec.is_empty() || track.codec == "?" {
            "H264"
        } else {
            track.codec.as_str()
        };
        if codec != "H264" {
            self.len = 0;
            return Ok(());
        }
        self.len = track.init.len() + 20;
        self.ensure_size()?;
        self.data[16..16 + track.init.len()].copy_from_slice(&track.init);
        self.data[12] = 0;
        self.data[13] = 0;
        self.data[14] = 0;
        self.data[15] = 0;
        self.data[11] = 0x17;
        self.is_keyframe = true;
        self.finish_tag(0x09, 0);
        Ok(())
    }

    /// Build the audio init-data tag (AAC sequence header) for a track.
    pub fn audio_init(&mut self, track: &TrackMeta) -> Result<()> {
        let codec = if track.codec.is_empty() || track.codec == "?" {
            "AAC"
        } else {
            track.codec.as_str()
        };
        if codec != "AAC" {
            self.len = 0;
            return Ok(());
        }
        self.len = track.init.len() + 17;
        self.ensure_size()?;
        self.data[13..13 + track.init.len()].copy_from_slice(&track.init);
        self.data[12] = 0;
        self.data[11] = audio_format_bits(codec, Some(track));
        self.is_keyframe = false;
        self.finish_tag(0x08, 0);
        Ok(())
    }

    /// Build an onMetaData script tag describing the stream.
    pub fn meta_init(&mut self, meta: &StreamMeta) -> Result<()> {
        let mut props = BTreeMap::new();
        if meta.length_ms > 0 {
            props.insert(
                "duration".to_string(),
                AmfValue::Number(meta.length_ms as f64 / 1000.0),
            );
        }
        let video = meta
            .tracks
            .values()
            .find(|t| t.kind == Some(TrackKind::Video));
        let audio = meta
            .tracks
            .values()
            .find(|t| t.kind == Some(TrackKind::Audio));
        if let Some(track) = video {
            props.insert("hasVideo".to_string(), AmfValue::Boolean(true));
            match track.codec.as_str() {
                "H264" | "?" | "" => {
                    props.insert("videocodecid".to_string(), AmfValue::String("avc1".into()));
                }
                "VP6" => {
                    props.insert("videocodecid".to_string(), AmfValue::Number(4.0));
                }
                "H263" => {
                    props.insert("videocodecid".to_string(), AmfValue::Number(2.0));
                }
                _ => {}
            }
            if track.width > 0 {
                props.insert("width".to_string(), AmfValue::Number(track.width as f64));
            }
            if track.height > 0 {
                props.insert("height".to_string(), AmfValue::Number(track.height as f64));
            }
            if track.fpks > 0 {
                props.insert(
                    "videoframerate".to_string(),
                    AmfValue::Number(track.fpks as f64 / 1000.0),
                );
            }
            if track.bps > 0 {
                props.insert(
                    "videodatarate".to_string(),
                    AmfValue::Number(track.bps as f64 / 128.0),
                );
            }
        }
        if let Some(track) = audio {
            props.insert("hasAudio".to_string(), AmfValue::Boolean(true));
            props.insert("audiodelay".to_string(), AmfValue::Number(0.0));
            match track.codec.as_str() {
                "AAC" | "?" | "" => {
                    props.insert("audiocodecid".to_string(), AmfValue::String("mp4a".into()));
                }
                "MP3" => {
                    props.insert("audiocodecid".to_string(), AmfValue::String("mp3".into()));
                }
                _ => {}
            }
            if track.channels > 0 {
                props.insert(
                    "audiochannels".to_string(),
                    AmfValue::Number(track.channels as f64),
                );
            }
            if track.rate > 0 {
                props.insert(
                    "audiosamplerate".to_string(),
                    AmfValue::Number(track.rate as f64),
                );
            }
            if track.size > 0 {
                props.insert(
                    "audiosamplesize".to_string(),
                    AmfValue::Number(track.size as f64),
                );
            }
            if track.bps > 0 {
                props.insert(
                    "audiodatarate".to_string(),
                    AmfValue::Number(track.bps as f64 / 128.0),
                );
            }
        }
        let body = amf::encode_all(&[
            AmfValue::String("onMetaData".into()),
            AmfValue::EcmaArray(props),
        ]);
        self.len = body.len() + 15;
        self.ensure_size()?;
        self.data[11..11 + body.len()].copy_from_slice(&body);
        self.is_keyframe = false;
        self.finish_tag(0x12, 0);
        Ok(())
    }
}

fn audio_format_bits(codec: &str, track: Option<&TrackMeta>) -> u8 {
    let mut bits = 0u8;
    if codec == "AAC" {
        bits += 0xA0;
    }
    if codec == "MP3" {
        bits += 0x20;
    }
    if let Some(track) = track {
        bits += sample_rate_bits(track.rate);
        if track.size == 16 {
            bits += 0x02;
        }
        if track.channels > 1 {
            bits += 0x01;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Assemble the wire form of one tag: header + body + trailer.
    fn wire_tag(tag_type: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 11];
        out[0] = tag_type;
        out[1] = ((body.len() >> 16) & 0xFF) as u8;
        out[2] = ((body.len() >> 8) & 0xFF) as u8;
        out[3] = (body.len() & 0xFF) as u8;
        out[4] = ((timestamp >> 16) & 0xFF) as u8;
        out[5] = ((timestamp >> 8) & 0xFF) as u8;
        out[6] = (timestamp & 0xFF) as u8;
        out[7] = ((timestamp >> 24) & 0xFF) as u8;
        out.extend_from_slice(body);
        out.extend_from_slice(&((11 + body.len()) as u32).to_be_bytes());
        out
    }

    fn load_one(bytes: &[u8]) -> Tag {
        let mut buffer = Buffer::new();
        buffer.append(bytes);
        let mut tag = Tag::new();
        assert!(tag.load_from(&mut buffer).unwrap());
        tag
    }

    #[test]
    fn test_container_header_recognised() {
        let header = [
            0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut buffer = Buffer::new();
        buffer.append(&header);
        let mut tag = Tag::new();
        // consumed entirely, no tag produced
        assert!(!tag.load_from(&mut buffer).unwrap());
        assert_eq!(buffer.bytes(16), 0);
        assert_eq!(last_header(), header);
    }

    #[test]
    fn test_invalid_container_header() {
        // DataOffset byte is 0x08 instead of 0x09
        let header = [
            0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut buffer = Buffer::new();
        buffer.append(&header);
        let mut tag = Tag::new();
        assert!(tag.load_from(&mut buffer).is_err());
    }

    #[test]
    fn test_invalid_tag_type() {
        let wire = wire_tag(0x13, 0, &[0, 0]);
        let mut buffer = Buffer::new();
        buffer.append(&wire);
        let mut tag = Tag::new();
        assert!(tag.load_from(&mut buffer).is_err());
    }

    #[test]
    fn test_incremental_load_byte_by_byte() {
        let wire = wire_tag(0x09, 1000, &[0x17, 0x01, 0, 0, 0, 0xAA, 0xBB]);
        let mut tag = Tag::new();
        let mut buffer = Buffer::new();
        let mut completions = 0;
        for byte in &wire {
            buffer.append(std::slice::from_ref(byte));
            if tag.load_from(&mut buffer).unwrap() {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert!(tag.is_keyframe);
        assert_eq!(tag.timestamp(), 1000);
        assert_eq!(tag.len(), wire.len());
    }

    #[test]
    fn test_timestamp_split_layout() {
        let mut tag = load_one(&wire_tag(0x09, 0, &[0x27, 0x01, 0, 0, 0]));
        tag.set_timestamp(0x12345678);
        assert_eq!(tag.bytes()[4], 0x34);
        assert_eq!(tag.bytes()[5], 0x56);
        assert_eq!(tag.bytes()[6], 0x78);
        assert_eq!(tag.bytes()[7], 0x12);
        assert_eq!(tag.timestamp(), 0x12345678);
    }

    #[test]
    fn test_aac_init_tag_to_meta() {
        // audio AAC sequence header: AF 00 12 10
        let tag = load_one(&wire_tag(0x08, 0, &[0xAF, 0x00, 0x12, 0x10]));
        assert!(tag.needs_init_data());
        assert!(tag.is_init_data());

        let mut meta = StreamMeta::default();
        assert!(tag.to_packet(&mut meta).is_none());
        let track = meta.track(AUDIO_TRACK).unwrap();
        assert_eq!(track.codec, "AAC");
        assert_eq!(track.init.as_ref(), &[0x12, 0x10]);
    }

    #[test]
    fn test_aac_frame_to_packet() {
        let tag = load_one(&wire_tag(0x08, 40, &[0xAF, 0x01, 0xDE, 0xAD, 0xBE]));
        let mut meta = StreamMeta::default();
        let packet = tag.to_packet(&mut meta).unwrap();
        assert_eq!(packet.kind, Kind::Audio);
        assert_eq!(packet.track_id, AUDIO_TRACK);
        assert_eq!(packet.timestamp_ms, 40);
        assert_eq!(packet.payload.as_ref(), &[0xDE, 0xAD, 0xBE]);
        let track = meta.track(AUDIO_TRACK).unwrap();
        assert_eq!(track.rate, 44100);
        assert_eq!(track.size, 16);
        assert_eq!(track.channels, 2);
    }

    #[test]
    fn test_h264_frame_to_packet() {
        // keyframe, NALU, composition offset -2
        let body = [0x17, 0x01, 0xFF, 0xFF, 0xFE, 0x65, 0x88, 0x01];
        let tag = load_one(&wire_tag(0x09, 2000, &body));
        let mut meta = StreamMeta::default();
        let packet = tag.to_packet(&mut meta).unwrap();
        assert_eq!(packet.kind, Kind::Video);
        assert!(packet.keyframe);
        assert_eq!(packet.nalu, Some(NaluFlag::Unit));
        assert_eq!(packet.offset, Some(-2));
        assert_eq!(packet.payload.as_ref(), &[0x65, 0x88, 0x01]);
        assert_eq!(meta.track(VIDEO_TRACK).unwrap().codec, "H264");
    }

    #[test]
    fn test_video_info_frame_dropped() {
        let tag = load_one(&wire_tag(0x09, 0, &[0x52, 0x00, 0x01]));
        let mut meta = StreamMeta::default();
        assert!(tag.to_packet(&mut meta).is_none());
    }

    #[test]
    fn test_flv_roundtrip_h264() {
        let body = [0x27, 0x01, 0x00, 0x00, 0x05, 0x41, 0x9A, 0x02];
        let tag = load_one(&wire_tag(0x09, 3000, &body));
        let mut meta = StreamMeta::default();
        let packet = tag.to_packet(&mut meta).unwrap();

        let mut out = Tag::new();
        out.from_packet(&packet, &meta).unwrap();
        assert_eq!(out.bytes(), load_one(&wire_tag(0x09, 3000, &body)).bytes());

        // and the re-serialised tag classifies identically
        let mut meta2 = StreamMeta::default();
        let packet2 = out.to_packet(&mut meta2).unwrap();
        assert_eq!(packet2.kind, packet.kind);
        assert_eq!(packet2.timestamp_ms, packet.timestamp_ms);
        assert_eq!(packet2.interframe, packet.interframe);
        assert_eq!(packet2.offset, packet.offset);
        assert_eq!(packet2.payload, packet.payload);
    }

    #[test]
    fn test_flv_roundtrip_aac() {
        let mut meta = StreamMeta::default();
        let _ = load_one(&wire_tag(0x08, 0, &[0xAF, 0x00, 0x12, 0x10])).to_packet(&mut meta);
        let tag = load_one(&wire_tag(0x08, 80, &[0xAF, 0x01, 0x21, 0x44]));
        let packet = tag.to_packet(&mut meta).unwrap();

        let mut out = Tag::new();
        out.from_packet(&packet, &meta).unwrap();
        assert_eq!(out.bytes(), tag.bytes());
    }

    #[test]
    fn test_script_tag_populates_meta_and_data() {
        let mut props = BTreeMap::new();
        props.insert("width".to_string(), AmfValue::Number(1920.0));
        props.insert("height".to_string(), AmfValue::Number(1080.0));
        props.insert("framerate".to_string(), AmfValue::Number(29.97));
        props.insert("videocodecid".to_string(), AmfValue::Number(7.0));
        props.insert("audiocodecid".to_string(), AmfValue::Number(10.0));
        props.insert("audiosamplerate".to_string(), AmfValue::Number(48000.0));
        props.insert("encoder".to_string(), AmfValue::String("obs 30".into()));
        let body = amf::encode_all(&[
            AmfValue::String("onMetaData".into()),
            AmfValue::EcmaArray(props),
        ]);
        let tag = load_one(&wire_tag(0x12, 0, &body));

        let mut meta = StreamMeta::default();
        let packet = tag.to_packet(&mut meta).unwrap();
        assert_eq!(packet.kind, Kind::Meta);
        assert_eq!(packet.track_id, META_TRACK);
        assert_eq!(
            packet.data.get("encoder").and_then(Value::as_str),
            Some("obs 30")
        );

        let video = meta.track(VIDEO_TRACK).unwrap();
        assert_eq!(video.codec, "H264");
        assert_eq!(video.width, 1920);
        assert_eq!(video.height, 1080);
        assert_eq!(video.fpks, 29970);
        assert_eq!(meta.track(AUDIO_TRACK).unwrap().codec, "AAC");
        assert_eq!(meta.track(AUDIO_TRACK).unwrap().rate, 48000);
    }

    #[test]
    fn test_video_init_tag() {
        let mut track = TrackMeta::new(VIDEO_TRACK, TrackKind::Video);
        track.codec = "H264".into();
        track.init = Bytes::from_static(&[0x01, 0x64, 0x00, 0x1F]);
        let mut tag = Tag::new();
        tag.video_init(&track).unwrap();

        assert_eq!(tag.bytes()[0], 0x09);
        assert_eq!(tag.bytes()[11], 0x17);
        assert_eq!(tag.bytes()[12], 0);
        assert!(tag.is_init_data());
        assert_eq!(&tag.bytes()[16..20], &[0x01, 0x64, 0x00, 0x1F]);
    }

    #[test]
    fn test_audio_init_tag() {
        let mut track = TrackMeta::new(AUDIO_TRACK, TrackKind::Audio);
        track.codec = "AAC".into();
        track.init = Bytes::from_static(&[0x12, 0x10]);
        track.rate = 44100;
        track.size = 16;
        track.channels = 2;
        let mut tag = Tag::new();
        tag.audio_init(&track).unwrap();

        assert_eq!(tag.bytes()[0], 0x08);
        assert_eq!(tag.bytes()[11], 0xAF);
        assert_eq!(tag.bytes()[12], 0);
        assert!(tag.is_init_data());
        assert_eq!(&tag.bytes()[13..15], &[0x12, 0x10]);
    }

    #[test]
    fn test_meta_init_roundtrip() {
        let mut meta = StreamMeta::default();
        meta.length_ms = 60_000;
        let video = meta.track_mut(VIDEO_TRACK, TrackKind::Video);
        video.codec = "H264".into();
        video.width = 1280;
        video.height = 720;
        let audio = meta.track_mut(AUDIO_TRACK, TrackKind::Audio);
        audio.codec = "AAC".into();
        audio.rate = 44100;

        let mut tag = Tag::new();
        tag.meta_init(&meta).unwrap();
        assert_eq!(tag.bytes()[0], 0x12);

        let values = amf::decode_all(&tag.bytes()[11..tag.len() - 4]).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(values[1].get_number("duration"), Some(60.0));
        assert_eq!(values[1].get_string("videocodecid"), Some("avc1"));
        assert_eq!(values[1].get_string("audiocodecid"), Some("mp4a"));
        assert_eq!(values[1].get_number("width"), Some(1280.0));
    }

    #[test]
    fn test_previous_tag_size_trailer() {
        let tag = load_one(&wire_tag(0x08, 0, &[0x2F, 0x01, 0x02]));
        let trailer = u32::from_be_bytes(tag.bytes()[tag.len() - 4..].try_into().unwrap());
        assert_eq!(trailer as usize, tag.len() - 4);
    }
}
