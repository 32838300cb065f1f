//! MP4 header synthesis and media interleaving
//!
//! For a fixed stream this produces a byte-exact `ftyp` + `moov` + `mdat`
//! preamble whose `stco` tables point into a planned interleave of every
//! track's media parts. The plan orders all key-index entries globally by
//! time, then track, then byte position; each part is its own chunk, and
//! parts of other tracks advance the byte cursor without adding entries.
//!
//! Once the header is known, the [`Interleaver`] re-orders live-arriving
//! packets into exactly that plan so the caller can stream the `mdat`
//! payload verbatim behind the header.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::boxes;
use crate::error::{Mp4Error, Result};
use crate::sc::meta::{StreamMeta, TrackKind, TrackMeta};
use crate::sc::packet::Packet;

/// The fixed `stts` sample delta. Arbitrary, but the per-track timescale
/// is derived from the same constant so media time works out.
const SAMPLE_DELTA: u32 = 42;

/// One key of one track in the global interleave plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    pub time_ms: u64,
    pub track_id: u32,
    pub byte_pos: u64,
    /// Total payload bytes under this key.
    pub size: u64,
    /// Number of media parts under this key.
    pub part_count: u32,
    /// Individual part sizes, already decoded.
    pub part_sizes: Vec<u64>,
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time_ms, self.track_id, self.byte_pos).cmp(&(
            other.time_ms,
            other.track_id,
            other.byte_pos,
        ))
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A synthesised MP4 header plus the interleave plan it encodes.
#[derive(Debug)]
pub struct Mp4Header {
    /// `ftyp` + `moov` + 8-byte `mdat` preamble, ready to send.
    pub bytes: Bytes,
    /// Total size of the planned `mdat` payload.
    pub mdat_size: u64,
    /// The global interleave plan, in emission order.
    pub key_parts: Vec<KeyPart>,
}

impl Mp4Header {
    /// Plan the interleave and emit the header for a fixed stream.
    pub fn synthesise(meta: &StreamMeta) -> Result<Self> {
        let key_parts = plan_interleave(meta);
        let mdat_size: u64 = key_parts.iter().map(|k| k.size).sum();

        // lay the header out once to learn its size, then re-emit with every
        // stco entry shifted past ftyp + moov + the 8-byte mdat header
        let ftyp = boxes::ftyp();
        let moov = build_moov(meta, &key_parts, 0)?;
        let shift = (ftyp.len() + moov.len() + 8) as u64;
        let moov = build_moov(meta, &key_parts, shift)?;

        let mut bytes = BytesMut::with_capacity(ftyp.len() + moov.len() + 8);
        bytes.extend_from_slice(&ftyp);
        bytes.extend_from_slice(&moov);
        bytes.extend_from_slice(&boxes::mdat_preamble(mdat_size));
        Ok(Self {
            bytes: bytes.freeze(),
            mdat_size,
            key_parts,
        })
    }
}

fn plan_interleave(meta: &StreamMeta) -> Vec<KeyPart> {
    let mut parts = BTreeSet::new();
    for track in meta.tracks.values() {
        for key in &track.keys {
            if key.byte_size == 0 {
                continue;
            }
            parts.insert(KeyPart {
                time_ms: key.time_ms,
                track_id: track.track_id,
                byte_pos: key.byte_pos,
                size: key.byte_size,
                part_count: key.part_count,
                part_sizes: key.part_sizes(),
            });
        }
    }
    parts.into_iter().collect()
}

fn build_moov(meta: &StreamMeta, key_parts: &[KeyPart], stco_shift: u64) -> Result<BytesMut> {
    let mvhd = boxes::mvhd(meta.last_ms + meta.first_ms);
    let mut children: Vec<BytesMut> = vec![mvhd];
    for track in meta.tracks.values() {
        children.push(build_trak(track, key_parts, stco_shift)?);
    }
    let refs: Vec<&[u8]> = children.iter().map(|c| c.as_ref()).collect();
    Ok(boxes::container(b"moov", &refs))
}

fn build_trak(track: &TrackMeta, key_parts: &[KeyPart], stco_shift: u64) -> Result<BytesMut> {
    let kind = track
        .kind
        .ok_or_else(|| Mp4Error::UnsupportedCodec(track.codec.clone()))?;
    if track.keys.is_empty() {
        return Err(Mp4Error::EmptyKeyIndex(track.track_id).into());
    }
    let duration_ms = track.last_ms + track.first_ms;
    let total_parts = track.total_parts();

    // media timescale derived from the fixed sample delta; media time is
    // then total_parts * SAMPLE_DELTA ticks over the real duration
    let timescale = if duration_ms > 0 {
        ((SAMPLE_DELTA as f64 * total_parts as f64 / duration_ms as f64) * 1000.0).round() as u32
    } else {
        1000
    };
    let media_duration = (duration_ms as f64 * timescale as f64 / 1000.0) as u32;

    let stsd = match kind {
        TrackKind::Video => boxes::stsd_video(track)?,
        TrackKind::Audio => boxes::stsd_audio(track)?,
    };
    let stts = boxes::stts(total_parts as u32, SAMPLE_DELTA);

    let mut stbl_children: Vec<BytesMut> = vec![stsd, stts];
    if kind == TrackKind::Video {
        let mut samples = Vec::with_capacity(track.keys.len());
        let mut sample = 1u32;
        for key in &track.keys {
            samples.push(sample);
            sample += key.part_count;
        }
        stbl_children.push(boxes::stss(&samples));
    }
    stbl_children.push(boxes::stsc());

    let sizes: Vec<u32> = track
        .keys
        .iter()
        .flat_map(|k| k.part_sizes())
        .map(|s| s as u32)
        .collect();
    stbl_children.push(boxes::stsz(&sizes));

    // walk the global interleave: our parts get entries, everyone's bytes
    // advance the cursor
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut cursor = stco_shift;
    for part in key_parts {
        if part.track_id == track.track_id {
            for &size in &part.part_sizes {
                offsets.push(cursor);
                cursor += size;
            }
        } else {
            cursor += part.size;
        }
    }
    stbl_children.push(boxes::stco(&offsets));

    let stbl_refs: Vec<&[u8]> = stbl_children.iter().map(|c| c.as_ref()).collect();
    let stbl = boxes::container(b"stbl", &stbl_refs);

    let mhd = match kind {
        TrackKind::Video => boxes::vmhd(),
        TrackKind::Audio => boxes::smhd(),
    };
    let dinf = boxes::dinf();
    let minf = boxes::container(b"minf", &[&mhd, &dinf, &stbl]);

    let mdhd = boxes::mdhd(timescale, media_duration);
    let hdlr = boxes::hdlr(kind, &format!("track{}", track.track_id));
    let mdia = boxes::container(b"mdia", &[&mdhd, &hdlr, &minf]);

    let tkhd = boxes::tkhd(track);
    Ok(boxes::container(b"trak", &[&tkhd, &mdia]))
}

/// Re-orders incoming media packets into the planned interleave.
///
/// Packets whose track matches the current plan position are copied to the
/// output immediately; others wait in per-track queues until the plan
/// reaches them.
#[derive(Debug)]
pub struct Interleaver {
    key_parts: Vec<KeyPart>,
    cur_key: usize,
    cur_part: u32,
    queues: BTreeMap<u32, VecDeque<Bytes>>,
    out: BytesMut,
}

impl Interleaver {
    pub fn new(key_parts: Vec<KeyPart>) -> Self {
        Self {
            key_parts,
            cur_key: 0,
            cur_part: 0,
            queues: BTreeMap::new(),
            out: BytesMut::new(),
        }
    }

    fn advance_part(&mut self) {
        self.cur_part += 1;
        if self.cur_part >= self.key_parts[self.cur_key].part_count {
            self.cur_part = 0;
            self.cur_key += 1;
        }
    }

    /// True once every planned part has been emitted.
    pub fn finished(&self) -> bool {
        self.cur_key >= self.key_parts.len()
    }

    fn pump_queued(&mut self) {
        while !self.finished() {
            let track = self.key_parts[self.cur_key].track_id;
            let Some(queue) = self.queues.get_mut(&track) else {
                return;
            };
            let Some(payload) = queue.pop_front() else {
                return;
            };
            self.out.extend_from_slice(&payload);
            self.advance_part();
        }
    }

    /// Feed one media packet, in per-track time order.
    pub fn push(&mut self, packet: &Packet) {
        self.pump_queued();
        if self.finished() {
            tracing::warn!(track = packet.track_id, "packet beyond the planned interleave");
            return;
        }
        if self.key_parts[self.cur_key].track_id == packet.track_id {
            self.out.extend_from_slice(&packet.payload);
            self.advance_part();
            self.pump_queued();
        } else {
            self.queues
                .entry(packet.track_id)
                .or_default()
                .push_back(packet.payload.clone());
        }
    }

    /// True when output bytes are pending.
    pub fn ready(&self) -> bool {
        !self.out.is_empty()
    }

    /// Take the pending output.
    pub fn take(&mut self) -> Bytes {
        self.out.split().freeze()
    }
}
