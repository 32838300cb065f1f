//! ISOBMFF box serialisers
//!
//! Each box is `size(4) + type(4) + payload`; a "full" box prefixes its
//! payload with a version byte and 24-bit flags. Boxes are built bottom-up
//! as plain byte buffers so sizes are always correct by construction.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Mp4Error, Result};
use crate::sc::meta::{TrackKind, TrackMeta};

/// Wrap a payload in a box header.
pub fn raw_box(kind: &[u8; 4], payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(8 + payload.len());
    out.put_u32((8 + payload.len()) as u32);
    out.put_slice(kind);
    out.put_slice(payload);
    out
}

/// Wrap a payload in a full-box header (version + 24-bit flags).
pub fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.put_u8(version);
    body.put_slice(&flags.to_be_bytes()[1..]);
    body.put_slice(payload);
    raw_box(kind, &body)
}

/// Wrap child boxes in a container box.
pub fn container(kind: &[u8; 4], children: &[&[u8]]) -> BytesMut {
    let total: usize = children.iter().map(|c| c.len()).sum();
    let mut out = BytesMut::with_capacity(8 + total);
    out.put_u32((8 + total) as u32);
    out.put_slice(kind);
    for child in children {
        out.put_slice(child);
    }
    out
}

const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// `ftyp`: major brand mp41, compatible isom/iso2/avc1/mp41.
pub fn ftyp() -> BytesMut {
    let mut payload = BytesMut::with_capacity(24);
    payload.put_slice(b"mp41");
    payload.put_u32(0);
    payload.put_slice(b"isom");
    payload.put_slice(b"iso2");
    payload.put_slice(b"avc1");
    payload.put_slice(b"mp41");
    raw_box(b"ftyp", &payload)
}

/// `mvhd`: movie timescale 1000, identity matrix, volume 1.0.
pub fn mvhd(duration_ms: u64) -> BytesMut {
    let mut payload = BytesMut::with_capacity(96);
    payload.put_u32(0); // creation
    payload.put_u32(0); // modification
    payload.put_u32(1000); // timescale
    payload.put_u32(duration_ms as u32);
    payload.put_u32(0x0001_0000); // rate 1.0
    payload.put_u16(0x0100); // volume 1.0
    payload.put_u16(0);
    payload.put_u64(0);
    for entry in MATRIX {
        payload.put_u32(entry);
    }
    for _ in 0..6 {
        payload.put_u32(0);
    }
    payload.put_u32(0); // next track id
    full_box(b"mvhd", 0, 0, &payload)
}

/// `tkhd` with flags 15 (enabled, in movie, in preview).
pub fn tkhd(track: &TrackMeta) -> BytesMut {
    let duration = track.last_ms + track.first_ms;
    let mut payload = BytesMut::with_capacity(80);
    payload.put_u32(0); // creation
    payload.put_u32(0); // modification
    payload.put_u32(track.track_id);
    payload.put_u32(0);
    payload.put_u32(duration as u32);
    payload.put_u64(0);
    match track.kind {
        Some(TrackKind::Video) => {
            payload.put_u16(0); // layer
            payload.put_u16(0); // alternate group
            payload.put_u16(0); // volume
        }
        _ => {
            payload.put_u16(0);
            payload.put_u16(1);
            payload.put_u16(0x0100);
        }
    }
    payload.put_u16(0);
    for entry in MATRIX {
        payload.put_u32(entry);
    }
    match track.kind {
        Some(TrackKind::Video) => {
            payload.put_u32(track.width << 16);
            payload.put_u32(track.height << 16);
        }
        _ => {
            payload.put_u32(0);
            payload.put_u32(0);
        }
    }
    full_box(b"tkhd", 0, 15, &payload)
}

/// `mdhd` with the given media timescale.
pub fn mdhd(timescale: u32, duration: u32) -> BytesMut {
    let mut payload = BytesMut::with_capacity(20);
    payload.put_u32(0); // creation
    payload.put_u32(0); // modification
    payload.put_u32(timescale);
    payload.put_u32(duration);
    payload.put_u16(0); // language
    payload.put_u16(0);
    full_box(b"mdhd", 0, 0, &payload)
}

/// `hdlr` for a media kind, carrying the track name.
pub fn hdlr(kind: TrackKind, name: &str) -> BytesMut {
    let mut payload = BytesMut::with_capacity(21 + name.len());
    payload.put_u32(0); // pre-defined
    payload.put_slice(match kind {
        TrackKind::Video => b"vide",
        TrackKind::Audio => b"soun",
    });
    payload.put_u32(0);
    payload.put_u32(0);
    payload.put_u32(0);
    payload.put_slice(name.as_bytes());
    payload.put_u8(0);
    full_box(b"hdlr", 0, 0, &payload)
}

/// `vmhd` with flags 1.
pub fn vmhd() -> BytesMut {
    full_box(b"vmhd", 0, 1, &[0u8; 8])
}

/// `smhd`.
pub fn smhd() -> BytesMut {
    full_box(b"smhd", 0, 0, &[0u8; 4])
}

/// `dinf` with a single self-contained `url ` entry.
pub fn dinf() -> BytesMut {
    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref_payload = BytesMut::with_capacity(4 + url.len());
    dref_payload.put_u32(1);
    dref_payload.put_slice(&url);
    let dref = full_box(b"dref", 0, 0, &dref_payload);
    container(b"dinf", &[&dref])
}

/// `stsd` with a single `avc1` + `avcC` sample entry.
pub fn stsd_video(track: &TrackMeta) -> Result<BytesMut> {
    if track.codec != "H264" {
        return Err(Mp4Error::UnsupportedCodec(track.codec.clone()).into());
    }
    let avcc = raw_box(b"avcC", &track.init);

    let mut entry = BytesMut::with_capacity(78 + avcc.len());
    entry.put_slice(&[0u8; 6]); // reserved
    entry.put_u16(1); // data reference index
    entry.put_slice(&[0u8; 16]); // pre-defined + reserved
    entry.put_u16(track.width as u16);
    entry.put_u16(track.height as u16);
    entry.put_u32(0x0048_0000); // 72 dpi horizontal
    entry.put_u32(0x0048_0000); // 72 dpi vertical
    entry.put_u32(0);
    entry.put_u16(1); // frame count
    entry.put_slice(&[b' '; 32]); // compressor name
    entry.put_u16(0x0018); // depth
    entry.put_u16(0);
    entry.put_slice(&avcc);
    let avc1 = raw_box(b"avc1", &entry);

    let mut payload = BytesMut::with_capacity(4 + avc1.len());
    payload.put_u32(1);
    payload.put_slice(&avc1);
    Ok(full_box(b"stsd", 0, 0, &payload))
}

/// `stsd` with a single `mp4a` + `esds` sample entry.
pub fn stsd_audio(track: &TrackMeta) -> Result<BytesMut> {
    if track.codec != "AAC" {
        return Err(Mp4Error::UnsupportedCodec(track.codec.clone()).into());
    }
    let esds = esds(track);

    let mut entry = BytesMut::with_capacity(28 + esds.len());
    entry.put_slice(&[0u8; 6]); // reserved
    entry.put_u16(1); // data reference index
    entry.put_slice(&[0u8; 8]); // version, revision, vendor
    entry.put_u16(track.channels as u16);
    entry.put_u16(track.size as u16);
    entry.put_u32(0); // pre-defined + reserved
    entry.put_u32(track.rate << 16); // 16.16 sample rate
    entry.put_slice(&esds);
    let mp4a = raw_box(b"mp4a", &entry);

    let mut payload = BytesMut::with_capacity(4 + mp4a.len());
    payload.put_u32(1);
    payload.put_slice(&mp4a);
    Ok(full_box(b"stsd", 0, 0, &payload))
}

/// `esds` elementary stream descriptor for an AAC track.
fn esds(track: &TrackMeta) -> BytesMut {
    let init_len = track.init.len();
    let mut payload = BytesMut::with_capacity(41 + init_len);
    // ES descriptor
    payload.put_u8(0x03);
    payload.put_slice(&[0x80, 0x80, 0x80]);
    payload.put_u8((32 + init_len) as u8);
    payload.put_u16(2); // ES id
    payload.put_u8(0); // stream priority
    // decoder config descriptor
    payload.put_u8(0x04);
    payload.put_slice(&[0x80, 0x80, 0x80]);
    payload.put_u8((18 + init_len) as u8);
    payload.put_u8(0x40); // MPEG-4 audio
    payload.put_u8(0x15); // stream type 5, reserved flag
    payload.put_slice(&1_250_000u32.to_be_bytes()[1..]); // buffer size (24-bit)
    payload.put_u32(10_000_000); // max bitrate
    payload.put_u32(track.bps * 8); // average bitrate
    // decoder specific info
    payload.put_u8(0x05);
    payload.put_slice(&[0x80, 0x80, 0x80]);
    payload.put_u8(init_len as u8);
    payload.put_slice(&track.init);
    // SL config descriptor
    payload.put_u8(0x06);
    payload.put_slice(&[0x80, 0x80, 0x80]);
    payload.put_u8(1);
    payload.put_u8(0x02);
    full_box(b"esds", 0, 0, &payload)
}

/// `stts` with a single run of samples at a fixed delta.
pub fn stts(sample_count: u32, sample_delta: u32) -> BytesMut {
    let mut payload = BytesMut::with_capacity(12);
    payload.put_u32(1);
    payload.put_u32(sample_count);
    payload.put_u32(sample_delta);
    full_box(b"stts", 0, 0, &payload)
}

/// `stss`: 1-based sync sample numbers.
pub fn stss(samples: &[u32]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(4 + samples.len() * 4);
    payload.put_u32(samples.len() as u32);
    for &sample in samples {
        payload.put_u32(sample);
    }
    full_box(b"stss", 0, 0, &payload)
}

/// `stsc`: every media part is its own chunk.
pub fn stsc() -> BytesMut {
    let mut payload = BytesMut::with_capacity(16);
    payload.put_u32(1);
    payload.put_u32(1); // first chunk
    payload.put_u32(1); // samples per chunk
    payload.put_u32(1); // sample description index
    full_box(b"stsc", 0, 0, &payload)
}

/// `stsz` with explicit per-sample sizes.
pub fn stsz(sizes: &[u32]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(8 + sizes.len() * 4);
    payload.put_u32(0); // no constant size
    payload.put_u32(sizes.len() as u32);
    for &size in sizes {
        payload.put_u32(size);
    }
    full_box(b"stsz", 0, 0, &payload)
}

/// Version-1 `stco` with 64-bit chunk offsets, required past 4 GiB.
pub fn stco(offsets: &[u64]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(4 + offsets.len() * 8);
    payload.put_u32(offsets.len() as u32);
    for &offset in offsets {
        payload.put_u64(offset);
    }
    full_box(b"stco", 1, 0, &payload)
}

/// The 8-byte `mdat` preamble: 32-bit size then the tag.
pub fn mdat_preamble(size: u64) -> Bytes {
    let mut out = BytesMut::with_capacity(8);
    out.put_u32(size as u32);
    out.put_slice(b"mdat");
    out.freeze()
}
