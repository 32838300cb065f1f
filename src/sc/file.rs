//! Seekable on-disk SC files
//!
//! Layout: a header record at offset 0 (`DTSC-hdr`, 4-byte big-endian body
//! length, DTMI metadata body) followed by packet records. A header may
//! point at a replacement header appended later via its `moreheader`
//! member; reads follow the chain and keep the newest.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::meta::StreamMeta;
use super::packet::{Packet, HEADER_MAGIC, PACKET_MAGIC};
use super::value::Value;
use crate::error::{ContainerError, Result};

/// A per-track byte cursor, ordered by time, then byte position, then track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeekPos {
    pub seek_time: u64,
    pub byte_pos: u64,
    pub track_id: u32,
}

/// A seekable SC file.
pub struct ScFile {
    file: File,
    meta: StreamMeta,
    /// Metadata of the header at offset 0, before any `moreheader` chain.
    first_meta: StreamMeta,
    header_size: usize,
    last_read_pos: u64,
    last_packet: Option<Packet>,
    positions: BTreeSet<SeekPos>,
    selected_tracks: BTreeSet<u32>,
}

impl ScFile {
    /// Open an existing file and scan its header chain.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path.as_ref()) {
            Ok(f) => f,
            Err(_) => OpenOptions::new().read(true).open(path.as_ref())?,
        };
        let mut sc = Self {
            file,
            meta: StreamMeta::default(),
            first_meta: StreamMeta::default(),
            header_size: 0,
            last_read_pos: 0,
            last_packet: None,
            positions: BTreeSet::new(),
            selected_tracks: BTreeSet::new(),
        };
        sc.read_header_chain(0)?;
        sc.file.seek(SeekFrom::Start(12 + sc.header_size as u64))?;
        Ok(sc)
    }

    /// Create a new file with an empty placeholder header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(HEADER_MAGIC)?;
        file.write_all(&0u32.to_be_bytes())?;
        Ok(Self {
            file,
            meta: StreamMeta::default(),
            first_meta: StreamMeta::default(),
            header_size: 0,
            last_read_pos: 0,
            last_packet: None,
            positions: BTreeSet::new(),
            selected_tracks: BTreeSet::new(),
        })
    }

    fn read_header_chain(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut magic = [0u8; 8];
        self.file.read_exact(&mut magic)?;
        if &magic != HEADER_MAGIC {
            return Err(ContainerError::BadMagic.into());
        }
        let mut len_raw = [0u8; 4];
        self.file.read_exact(&mut len_raw)?;
        let len = u32::from_be_bytes(len_raw) as usize;
        let mut body = vec![0u8; len];
        self.file.read_exact(&mut body)?;
        let (value, _) = Value::decode(&body)?;
        let meta = StreamMeta::from_value(&value);
        if pos == 0 {
            self.header_size = len;
            self.first_meta = meta.clone();
        }
        // a later, more complete header may have been appended
        let moreheader = value.get_int("moreheader").unwrap_or(0);
        self.meta = meta;
        if moreheader > 0 {
            self.read_header_chain(moreheader as u64)?;
        }
        Ok(())
    }

    /// Current (possibly chained) metadata.
    pub fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    /// Metadata of the header at offset 0.
    pub fn first_meta(&self) -> &StreamMeta {
        &self.first_meta
    }

    /// Size of the header body at offset 0.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Byte position of the record that [`parse_next`](Self::parse_next)
    /// last read.
    pub fn last_read_pos(&self) -> u64 {
        self.last_read_pos
    }

    /// Restrict seeking and key-continuation to the given tracks.
    /// An empty set selects all tracks.
    pub fn select_tracks(&mut self, tracks: BTreeSet<u32>) {
        self.selected_tracks = tracks;
        self.positions.clear();
    }

    fn track_selected(&self, track_id: u32) -> bool {
        self.selected_tracks.is_empty() || self.selected_tracks.contains(&track_id)
    }

    /// (Re)write the header body at offset 0.
    ///
    /// Unless `force` is set, the new body must be exactly as large as the
    /// existing one; a forced write of a larger body overwrites whatever
    /// follows the header area.
    pub fn write_header(&mut self, body: &[u8], force: bool) -> Result<()> {
        if self.header_size != body.len() && !force {
            return Err(ContainerError::HeaderSizeMismatch {
                existing: self.header_size,
                new: body.len(),
            }
            .into());
        }
        self.header_size = body.len();
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&(body.len() as u32).to_be_bytes())?;
        self.file.write_all(body)?;
        if let Ok((value, _)) = Value::decode(body) {
            self.meta = StreamMeta::from_value(&value);
        }
        Ok(())
    }

    /// Append a header record at the end of the file; returns its byte
    /// position, to be stored as `moreheader` in the offset-0 header.
    pub fn add_header(&mut self, body: &[u8]) -> Result<u64> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(HEADER_MAGIC)?;
        self.file.write_all(&(body.len() as u32).to_be_bytes())?;
        self.file.write_all(body)?;
        Ok(pos)
    }

    /// Append a packet record at the end of the file.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&packet.encode())?;
        Ok(())
    }

    /// Populate per-track cursors at the last key at or before `ms`.
    /// Returns false when no selected track has a usable key.
    pub fn seek_time(&mut self, ms: u64) -> bool {
        self.positions.clear();
        let mut found = false;
        for track in self.meta.tracks.values() {
            if !self.track_selected(track.track_id) || track.keys.is_empty() {
                continue;
            }
            let key = track
                .keys
                .iter()
                .rev()
                .find(|k| k.time_ms <= ms)
                .unwrap_or(&track.keys[0]);
            self.positions.insert(SeekPos {
                seek_time: key.time_ms,
                byte_pos: key.byte_pos,
                track_id: track.track_id,
            });
            found = true;
        }
        found
    }

    /// Pop the earliest cursor and seek the file to it.
    pub fn seek_next(&mut self) -> Result<Option<SeekPos>> {
        let Some(pos) = self.positions.pop_first() else {
            return Ok(None);
        };
        self.file.seek(SeekFrom::Start(pos.byte_pos))?;
        Ok(Some(pos))
    }

    /// Read one packet record at the current file position.
    ///
    /// Embedded header records are applied to the metadata and skipped.
    /// Returns `None` at end of file. After reading a packet, the owning
    /// track's next key (if any) is queued so interleaved key-by-key
    /// reading continues across tracks.
    pub fn parse_next(&mut self) -> Result<Option<Packet>> {
        loop {
            let record_pos = self.file.stream_position()?;
            let mut head = [0u8; 8];
            match self.file.read_exact(&mut head) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            if head == *HEADER_MAGIC {
                // an appended header mid-file: apply it, skip its body
                let mut len_raw = [0u8; 4];
                self.file.read_exact(&mut len_raw)?;
                let len = u32::from_be_bytes(len_raw) as u64;
                let body_pos = self.file.stream_position()?;
                self.read_header_chain(record_pos)?;
                self.file.seek(SeekFrom::Start(body_pos + len))?;
                continue;
            }
            if &head[..4] != PACKET_MAGIC {
                return Err(ContainerError::BadMagic.into());
            }
            let len = u32::from_be_bytes(head[4..8].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            self.file.read_exact(&mut body)?;
            let (value, _) = Value::decode(&body)?;
            let packet = Packet::from_value(&value)?;
            self.last_read_pos = record_pos;
            self.queue_next_key(packet.track_id, record_pos);
            self.last_packet = Some(packet.clone());
            return Ok(Some(packet));
        }
    }

    fn queue_next_key(&mut self, track_id: u32, read_pos: u64) {
        if !self.track_selected(track_id) {
            return;
        }
        let Some(track) = self.meta.track(track_id) else {
            return;
        };
        if let Some(key) = track.keys.iter().find(|k| k.byte_pos > read_pos) {
            self.positions.insert(SeekPos {
                seek_time: key.time_ms,
                byte_pos: key.byte_pos,
                track_id,
            });
        }
    }

    /// True when the last-read packet began on a key index entry.
    pub fn at_keyframe(&self) -> bool {
        let Some(packet) = &self.last_packet else {
            return false;
        };
        match self.meta.track(packet.track_id) {
            Some(track) => track.keys.iter().any(|k| k.byte_pos == self.last_read_pos),
            None => packet.keyframe,
        }
    }

    /// Byte position just past the last record.
    pub fn byte_pos_eof(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }
}

impl std::fmt::Debug for ScFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScFile")
            .field("header_size", &self.header_size)
            .field("tracks", &self.meta.tracks.len())
            .field("last_read_pos", &self.last_read_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sc::meta::{encode_sizes, KeyEntry, TrackKind};
    use crate::sc::packet::Kind;
    use bytes::Bytes;

    fn make_packet(track: u32, time: u64, keyframe: bool, payload: &'static [u8]) -> Packet {
        let kind = if track == 1 { Kind::Video } else { Kind::Audio };
        let mut p = Packet::new(kind, track, time, Bytes::from_static(payload));
        p.keyframe = keyframe;
        p
    }

    /// Write a two-track file with a real key index and return its path.
    ///
    /// Follows the recording flow: reserve a base header up front, append
    /// packets, append the full header at EOF, then point `moreheader` at
    /// it with a same-size base rewrite.
    fn write_fixture(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("fixture.sc");
        let mut file = ScFile::create(&path).unwrap();

        let mut base = StreamMeta::default().to_value();
        base.set("moreheader", 0i64);
        file.write_header(&base.encode(), true).unwrap();

        let packets = [
            make_packet(1, 0, true, b"kf-one"),
            make_packet(2, 10, false, b"aud"),
            make_packet(1, 40, false, b"frame"),
            make_packet(1, 2000, true, b"kf-two"),
        ];
        let mut offsets = Vec::new();
        for p in &packets {
            offsets.push(file.byte_pos_eof().unwrap());
            file.write_packet(p).unwrap();
        }

        let mut meta = StreamMeta::default();
        let video = meta.track_mut(1, TrackKind::Video);
        video.codec = "H264".into();
        video.keys = vec![
            KeyEntry {
                time_ms: 0,
                byte_pos: offsets[0],
                length_ms: 2000,
                byte_size: 11,
                part_count: 2,
                encoded_part_sizes: encode_sizes(&[6, 5]),
            },
            KeyEntry {
                time_ms: 2000,
                byte_pos: offsets[3],
                length_ms: 1000,
                byte_size: 6,
                part_count: 1,
                encoded_part_sizes: encode_sizes(&[6]),
            },
        ];
        meta.track_mut(2, TrackKind::Audio).codec = "AAC".into();

        let full_pos = file.add_header(&meta.to_value().encode()).unwrap();
        base.set("moreheader", full_pos as i64);
        file.write_header(&base.encode(), false).unwrap();
        path
    }

    #[test]
    fn test_create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);

        let file = ScFile::open(&path).unwrap();
        assert_eq!(file.meta().track(1).unwrap().codec, "H264");
        assert_eq!(file.meta().track(2).unwrap().codec, "AAC");
        assert!(file.header_size() > 0);
    }

    #[test]
    fn test_sequential_parse_reads_all_packets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let mut file = ScFile::open(&path).unwrap();

        // open() leaves the cursor past the offset-0 header; the appended
        // full header at EOF is applied and skipped
        let mut seen = Vec::new();
        while let Some(p) = file.parse_next().unwrap() {
            seen.push((p.track_id, p.timestamp_ms));
        }
        assert_eq!(
            seen,
            vec![(1, 0), (2, 10), (1, 40), (1, 2000)]
        );
    }

    #[test]
    fn test_seek_time_and_at_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let mut file = ScFile::open(&path).unwrap();

        assert!(file.seek_time(2100));
        let pos = file.seek_next().unwrap().unwrap();
        assert_eq!(pos.seek_time, 2000);
        assert_eq!(pos.track_id, 1);

        let packet = file.parse_next().unwrap().unwrap();
        assert_eq!(packet.timestamp_ms, 2000);
        assert!(packet.keyframe);
        assert!(file.at_keyframe());
    }

    #[test]
    fn test_seek_time_before_first_key_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let mut file = ScFile::open(&path).unwrap();
        let tracks: BTreeSet<u32> = [1u32].into_iter().collect();
        file.select_tracks(tracks);

        assert!(file.seek_time(0));
        let pos = file.seek_next().unwrap().unwrap();
        assert_eq!(pos.seek_time, 0);
        let packet = file.parse_next().unwrap().unwrap();
        assert_eq!(packet.payload.as_ref(), b"kf-one");
    }

    #[test]
    fn test_write_header_size_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir);
        let mut file = ScFile::open(&path).unwrap();

        let existing = file.header_size();
        let err = file.write_header(&[0xE0, 0x00, 0x00, 0xEE], false);
        assert!(err.is_err());
        assert_eq!(file.header_size(), existing);
    }

    #[test]
    fn test_add_header_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.sc");
        {
            let mut file = ScFile::create(&path).unwrap();
            let mut base = StreamMeta::default().to_value();
            base.set("moreheader", 0i64);
            file.write_header(&base.encode(), true).unwrap();

            let mut newer = StreamMeta::default();
            newer.track_mut(1, TrackKind::Video).codec = "H264".into();
            let newer_pos = file.add_header(&newer.to_value().encode()).unwrap();

            base.set("moreheader", newer_pos as i64);
            file.write_header(&base.encode(), false).unwrap();
        }

        let file = ScFile::open(&path).unwrap();
        // the chained header won
        assert_eq!(file.meta().track(1).unwrap().codec, "H264");
        // the first header is still reachable
        assert!(file.first_meta().tracks.is_empty());
    }
}
