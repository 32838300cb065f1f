//! Live stream buffer
//!
//! A time-ordered ring of recent packets across many tracks. One writer
//! ingests packets; any number of readers each hold a [`Ring`] cursor and
//! advance it independently by polling. Eviction is keyframe-aware: while a
//! video track exists, the oldest retained video packet is always a
//! keyframe, so a reader snapped forward by eviction can resume decoding
//! immediately.
//!
//! The stream holds only weak references to ring state; readers own their
//! rings and may drop them at any time.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::meta::StreamMeta;
use super::packet::{frame_header, Kind, Packet, HEADER_MAGIC, PACKET_MAGIC};
use super::value::Value;
use crate::net::{Buffer, Socket};

/// Position of one packet in the live buffer: time first, then track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LivePos {
    pub timestamp_ms: u64,
    pub track_id: u32,
}

impl LivePos {
    pub fn new(timestamp_ms: u64, track_id: u32) -> Self {
        Self {
            timestamp_ms,
            track_id,
        }
    }
}

/// Whether a wanted timestamp falls inside the retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// Inside the retained window; a seek lands on buffered data.
    Exact,
    /// Older than the retained window; a seek snaps forward to the head.
    Approximate,
    /// Newer than anything received so far.
    Unavailable,
}

#[derive(Debug)]
struct RingState {
    pos: Mutex<LivePos>,
    waiting: AtomicBool,
    starved: AtomicBool,
    updated: AtomicBool,
    play_count: AtomicI32,
}

/// A reader cursor into a [`Stream`].
///
/// The position only moves forward: the reader advances it through
/// [`Stream::get_next`], and eviction may push a lagging cursor up to the
/// new buffer head (setting the `updated` flag), never backward.
#[derive(Debug, Clone)]
pub struct Ring {
    state: Arc<RingState>,
}

impl Ring {
    fn new(pos: LivePos) -> Self {
        Self {
            state: Arc::new(RingState {
                pos: Mutex::new(pos),
                waiting: AtomicBool::new(false),
                starved: AtomicBool::new(false),
                updated: AtomicBool::new(true),
                play_count: AtomicI32::new(0),
            }),
        }
    }

    pub fn pos(&self) -> LivePos {
        *self.state.pos.lock().unwrap()
    }

    pub fn set_pos(&self, pos: LivePos) {
        *self.state.pos.lock().unwrap() = pos;
    }

    pub fn waiting(&self) -> bool {
        self.state.waiting.load(Ordering::Acquire)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.state.waiting.store(waiting, Ordering::Release);
    }

    /// True once the ring can no longer receive valid data.
    pub fn starved(&self) -> bool {
        self.state.starved.load(Ordering::Acquire)
    }

    /// True if the stream moved this ring (eviction) or new metadata arrived.
    /// Reading the flag clears it.
    pub fn take_updated(&self) -> bool {
        self.state.updated.swap(false, Ordering::AcqRel)
    }

    pub fn play_count(&self) -> i32 {
        self.state.play_count.load(Ordering::Acquire)
    }

    pub fn set_play_count(&self, count: i32) {
        self.state.play_count.store(count, Ordering::Release);
    }
}

/// The live packet buffer.
pub struct Stream {
    /// Current stream metadata, replaced whenever a header packet arrives.
    pub meta: StreamMeta,
    /// Raw wire bytes of the last received header, for replay to new readers.
    pub last_meta_pack: Bytes,
    buffers: BTreeMap<LivePos, Packet>,
    keyframes: BTreeMap<u32, BTreeSet<LivePos>>,
    buffer_count: usize,
    buffer_time_ms: u64,
    rings: Vec<Weak<RingState>>,
    ended: bool,
}

impl Stream {
    /// A stream retaining at least `buffer_count` packets and, when
    /// `buffer_time_ms` is non-zero, at least that much wall time.
    pub fn new(buffer_count: usize, buffer_time_ms: u64) -> Self {
        Self {
            meta: StreamMeta::default(),
            last_meta_pack: Bytes::new(),
            buffers: BTreeMap::new(),
            keyframes: BTreeMap::new(),
            buffer_count: buffer_count.max(1),
            buffer_time_ms,
            rings: Vec::new(),
            ended: false,
        }
    }

    pub fn set_buffer_time(&mut self, ms: u64) {
        self.buffer_time_ms = ms;
    }

    pub fn has_video(&self) -> bool {
        self.meta.has_video() || !self.keyframes.is_empty()
    }

    pub fn has_audio(&self) -> bool {
        self.meta.has_audio()
    }

    /// True after [`end_stream`](Self::end_stream).
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Number of retained packets.
    pub fn packet_count(&self) -> usize {
        self.buffers.len()
    }

    /// The packet at a buffer position.
    pub fn packet(&self, pos: LivePos) -> Option<&Packet> {
        self.buffers.get(&pos)
    }

    /// Newest buffered position, if any.
    pub fn newest(&self) -> Option<LivePos> {
        self.buffers.keys().next_back().copied()
    }

    /// Oldest buffered position, if any.
    pub fn oldest(&self) -> Option<LivePos> {
        self.buffers.keys().next().copied()
    }

    /// Re-serialise the current metadata as a wire header.
    pub fn out_header(&self) -> Bytes {
        frame_header(&self.meta.to_value())
    }

    /// Consume zero or one SC record from `buffer`.
    ///
    /// Returns true when a data packet was accepted. A header record is
    /// consumed and applied but does not return true on its own; partial
    /// input leaves the buffer untouched. Unrecognised bytes at a record
    /// boundary are dropped block-wise to re-sync.
    pub fn parse_packet(&mut self, buffer: &mut Buffer) -> bool {
        loop {
            let Some(head) = buffer.copy(8) else {
                return false;
            };
            if head.as_ref() == HEADER_MAGIC {
                let Some(framed) = buffer.copy(12) else {
                    return false;
                };
                let len = u32::from_be_bytes(framed[8..12].try_into().unwrap()) as usize;
                if !buffer.available(12 + len) {
                    return false;
                }
                let wire = buffer.remove(12 + len).unwrap();
                match Value::decode(&wire[12..]) {
                    Ok((value, _)) => {
                        self.meta = StreamMeta::from_value(&value);
                        self.last_meta_pack = wire;
                        self.mark_rings_updated();
                    }
                    Err(_) => {
                        tracing::warn!("discarding header with undecodable body");
                        return false;
                    }
                }
                continue;
            }
            if &head[..4] == PACKET_MAGIC {
                let len = u32::from_be_bytes(head[4..8].try_into().unwrap()) as usize;
                if !buffer.available(8 + len) {
                    return false;
                }
                let wire = buffer.remove(8 + len).unwrap();
                let packet = match Value::decode(&wire[8..]) {
                    Ok((value, _)) => match Packet::from_value(&value) {
                        Ok(p) => p,
                        Err(_) => return false,
                    },
                    Err(_) => return false,
                };
                self.add_packet(packet);
                return true;
            }
            // no magic at the boundary: drop the front block and re-sync
            tracing::warn!("invalid container data, re-syncing");
            buffer.get().clear();
            if buffer.size() == 0 {
                return false;
            }
        }
    }

    /// Insert a packet, bumping its timestamp past any occupied position,
    /// then evict down to the retention target.
    pub fn add_packet(&mut self, mut packet: Packet) {
        let mut pos = LivePos::new(packet.timestamp_ms, packet.track_id);
        while self.buffers.contains_key(&pos) {
            pos.timestamp_ms += 1;
        }
        packet.timestamp_ms = pos.timestamp_ms;

        if packet.kind == Kind::Video && packet.keyframe {
            self.keyframes
                .entry(packet.track_id)
                .or_default()
                .insert(pos);
        }
        self.buffers.insert(pos, packet);

        while self.should_evict() {
            self.cut_one_buffer();
        }
    }

    fn total_keyframes(&self) -> usize {
        self.keyframes.values().map(|set| set.len()).sum()
    }

    fn buffered_span_ms(&self) -> u64 {
        match (self.oldest(), self.newest()) {
            (Some(oldest), Some(newest)) => newest.timestamp_ms - oldest.timestamp_ms,
            _ => 0,
        }
    }

    fn should_evict(&self) -> bool {
        if self.buffers.len() <= self.buffer_count {
            return false;
        }
        if self.buffer_time_ms > 0 && self.buffered_span_ms() <= self.buffer_time_ms {
            return false;
        }
        if self.has_video() {
            return self.total_keyframes() > 1;
        }
        true
    }

    /// Drop the oldest GOP (or, without video, the single oldest packet),
    /// snapping any ring inside the dropped range forward to the new head.
    fn cut_one_buffer(&mut self) {
        let oldest_kf = self
            .keyframes
            .values()
            .filter_map(|set| set.first().copied())
            .min();
        let new_head = match oldest_kf {
            Some(oldest) => {
                // drop the oldest keyframe from the index, cut everything
                // before the next one
                for set in self.keyframes.values_mut() {
                    set.remove(&oldest);
                }
                self.keyframes.retain(|_, set| !set.is_empty());
                match self
                    .keyframes
                    .values()
                    .filter_map(|set| set.first().copied())
                    .min()
                {
                    Some(next) => {
                        while let Some((&pos, _)) = self.buffers.first_key_value() {
                            if pos >= next {
                                break;
                            }
                            self.buffers.pop_first();
                        }
                        next
                    }
                    None => {
                        // sole keyframe: behave like the no-video case
                        self.buffers.pop_first();
                        match self.oldest() {
                            Some(head) => head,
                            None => return,
                        }
                    }
                }
            }
            None => {
                self.buffers.pop_first();
                match self.oldest() {
                    Some(head) => head,
                    None => return,
                }
            }
        };
        self.advance_stale_rings(new_head);
    }

    fn advance_stale_rings(&mut self, new_head: LivePos) {
        self.rings.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let mut pos = state.pos.lock().unwrap();
            if *pos < new_head {
                *pos = new_head;
                state.updated.store(true, Ordering::Release);
            }
            true
        });
    }

    fn mark_rings_updated(&mut self) {
        self.rings.retain(|weak| match weak.upgrade() {
            Some(state) => {
                state.updated.store(true, Ordering::Release);
                true
            }
            None => false,
        });
    }

    /// Create a reader positioned at the newest keyframe across the selected
    /// tracks, or the newest packet when no keyframes apply. An empty track
    /// set selects all tracks.
    pub fn get_ring(&mut self, selected_tracks: &BTreeSet<u32>) -> Ring {
        let newest_kf = self
            .keyframes
            .iter()
            .filter(|(track, _)| selected_tracks.is_empty() || selected_tracks.contains(*track))
            .filter_map(|(_, set)| set.last().copied())
            .max();
        let pos = newest_kf
            .or_else(|| self.newest())
            .unwrap_or_default();
        let ring = Ring::new(pos);
        self.rings.push(Arc::downgrade(&ring.state));
        ring
    }

    /// Greatest position at or before `ms` on an allowed track, landing on a
    /// keyframe whenever video is among the allowed tracks.
    pub fn ms_seek(&self, ms: u64, allowed_tracks: &BTreeSet<u32>) -> LivePos {
        let allowed = |track: u32| allowed_tracks.is_empty() || allowed_tracks.contains(&track);
        let upper = LivePos::new(ms, u32::MAX);

        let video_allowed = self.keyframes.keys().any(|t| allowed(*t));
        if video_allowed {
            let before = self
                .keyframes
                .iter()
                .filter(|(track, _)| allowed(**track))
                .filter_map(|(_, set)| set.range(..=upper).next_back().copied())
                .max();
            if let Some(pos) = before {
                return pos;
            }
            // wanted time predates the buffer: oldest available keyframe
            if let Some(pos) = self
                .keyframes
                .iter()
                .filter(|(track, _)| allowed(**track))
                .filter_map(|(_, set)| set.first().copied())
                .min()
            {
                return pos;
            }
        }
        if let Some(pos) = self
            .buffers
            .range(..=upper)
            .rev()
            .find(|(pos, _)| allowed(pos.track_id))
            .map(|(pos, _)| *pos)
        {
            return pos;
        }
        self.buffers
            .keys()
            .find(|pos| allowed(pos.track_id))
            .copied()
            .unwrap_or_default()
    }

    /// Whether `ms` lies inside the retained window.
    pub fn can_seek_ms(&self, ms: u64) -> SeekResult {
        let (Some(oldest), Some(newest)) = (self.oldest(), self.newest()) else {
            return SeekResult::Unavailable;
        };
        if ms > newest.timestamp_ms {
            SeekResult::Unavailable
        } else if ms < oldest.timestamp_ms {
            SeekResult::Approximate
        } else {
            SeekResult::Exact
        }
    }

    /// True if no allowed packet exists after `pos`.
    pub fn is_newest(&self, pos: LivePos, allowed_tracks: &BTreeSet<u32>) -> bool {
        self.next_after(pos, allowed_tracks).is_none()
    }

    /// The next allowed position after `pos`, or `pos` unchanged when the
    /// reader has caught up (the caller then sets its ring waiting).
    pub fn get_next(&self, pos: LivePos, allowed_tracks: &BTreeSet<u32>) -> LivePos {
        self.next_after(pos, allowed_tracks).unwrap_or(pos)
    }

    fn next_after(&self, pos: LivePos, allowed_tracks: &BTreeSet<u32>) -> Option<LivePos> {
        self.buffers
            .range((Excluded(pos), Unbounded))
            .map(|(p, _)| *p)
            .find(|p| allowed_tracks.is_empty() || allowed_tracks.contains(&p.track_id))
    }

    /// Mark the stream terminal. Readers that have drained the buffer see
    /// their ring starve; the buffer itself stays readable.
    pub fn end_stream(&mut self) {
        self.ended = true;
        let newest = self.newest();
        self.rings.retain(|weak| match weak.upgrade() {
            Some(state) => {
                state.updated.store(true, Ordering::Release);
                if Some(*state.pos.lock().unwrap()) == newest || newest.is_none() {
                    state.starved.store(true, Ordering::Release);
                }
                true
            }
            None => false,
        });
    }

    /// Spool and parse from `socket` until metadata is known or the peer
    /// disconnects.
    pub async fn wait_for_meta(&mut self, socket: &mut Socket) {
        while self.meta.tracks.is_empty() && socket.connected() {
            let progressed = socket.spool();
            while self.parse_packet(socket.received()) {}
            if !self.meta.tracks.is_empty() {
                break;
            }
            if !progressed {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("packets", &self.buffers.len())
            .field("keyframes", &self.total_keyframes())
            .field("buffer_count", &self.buffer_count)
            .field("buffer_time_ms", &self.buffer_time_ms)
            .field("ended", &self.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sc::meta::TrackKind;

    fn video(time: u64, keyframe: bool) -> Packet {
        let mut p = Packet::new(Kind::Video, 1, time, Bytes::from_static(&[0x65]));
        p.keyframe = keyframe;
        p.interframe = !keyframe;
        p
    }

    fn audio(time: u64) -> Packet {
        Packet::new(Kind::Audio, 2, time, Bytes::from_static(&[0x21]))
    }

    fn all_tracks() -> BTreeSet<u32> {
        BTreeSet::new()
    }

    #[test]
    fn test_keyframe_aware_eviction() {
        // count=4, packets 100kf,120a,140,200kf,220a,240
        let mut stream = Stream::new(4, 0);
        stream.add_packet(video(100, true));
        stream.add_packet(audio(120));
        stream.add_packet(video(140, false));
        stream.add_packet(video(200, true));
        stream.add_packet(audio(220));
        stream.add_packet(video(240, false));

        let oldest = stream.oldest().unwrap();
        assert_eq!(oldest, LivePos::new(200, 1));
        assert!(stream.packet(oldest).unwrap().keyframe);
        assert_eq!(stream.packet_count(), 3);
    }

    #[test]
    fn test_live_pos_uniqueness() {
        let mut stream = Stream::new(100, 0);
        stream.add_packet(audio(50));
        stream.add_packet(audio(50));
        stream.add_packet(audio(50));
        assert_eq!(stream.packet_count(), 3);
        let times: Vec<u64> = stream.buffers.keys().map(|p| p.timestamp_ms).collect();
        assert_eq!(times, vec![50, 51, 52]);
    }

    #[test]
    fn test_no_video_evicts_single_oldest() {
        let mut stream = Stream::new(2, 0);
        stream.add_packet(audio(10));
        stream.add_packet(audio(20));
        stream.add_packet(audio(30));
        assert_eq!(stream.packet_count(), 2);
        assert_eq!(stream.oldest().unwrap(), LivePos::new(20, 2));
    }

    #[test]
    fn test_buffer_time_blocks_eviction() {
        let mut stream = Stream::new(2, 10_000);
        stream.add_packet(audio(0));
        stream.add_packet(audio(1000));
        stream.add_packet(audio(2000));
        // only 2s buffered, 10s wanted: nothing may be evicted
        assert_eq!(stream.packet_count(), 3);
        stream.add_packet(audio(20_000));
        assert!(stream.packet_count() < 4);
    }

    #[test]
    fn test_ring_advanced_by_eviction() {
        let mut stream = Stream::new(4, 0);
        stream.add_packet(video(100, true));
        let ring = stream.get_ring(&all_tracks());
        assert_eq!(ring.pos(), LivePos::new(100, 1));
        assert!(ring.take_updated());

        stream.add_packet(audio(120));
        stream.add_packet(video(140, false));
        stream.add_packet(video(200, true));
        stream.add_packet(audio(220));
        stream.add_packet(video(240, false));

        // the GOP at 100 was cut; the lagging ring snapped to the new head
        assert_eq!(ring.pos(), LivePos::new(200, 1));
        assert!(ring.take_updated());
        assert!(!ring.starved());
    }

    #[test]
    fn test_ring_monotonic_and_never_past_newest_keyframe() {
        let mut stream = Stream::new(4, 0);
        stream.add_packet(video(100, true));
        stream.add_packet(video(200, true));
        let ring = stream.get_ring(&all_tracks());
        assert_eq!(ring.pos(), LivePos::new(200, 1));
        let mut last = ring.pos();
        for t in [240u64, 280, 300, 340, 400] {
            stream.add_packet(video(t, t % 100 == 0));
            assert!(ring.pos() >= last);
            last = ring.pos();
        }
    }

    #[test]
    fn test_get_next_and_is_newest() {
        let mut stream = Stream::new(100, 0);
        stream.add_packet(video(100, true));
        stream.add_packet(audio(110));
        stream.add_packet(video(120, false));

        let video_only: BTreeSet<u32> = [1u32].into_iter().collect();
        let pos = LivePos::new(100, 1);
        assert_eq!(stream.get_next(pos, &video_only), LivePos::new(120, 1));
        assert_eq!(stream.get_next(pos, &all_tracks()), LivePos::new(110, 2));

        let end = LivePos::new(120, 1);
        assert!(stream.is_newest(end, &all_tracks()));
        // caught up: position comes back unchanged
        assert_eq!(stream.get_next(end, &all_tracks()), end);
    }

    #[test]
    fn test_ms_seek_prefers_keyframes() {
        let mut stream = Stream::new(100, 0);
        stream.add_packet(video(100, true));
        stream.add_packet(video(150, false));
        stream.add_packet(video(200, true));
        stream.add_packet(audio(210));

        assert_eq!(stream.ms_seek(180, &all_tracks()), LivePos::new(100, 1));
        assert_eq!(stream.ms_seek(205, &all_tracks()), LivePos::new(200, 1));
        // before the buffer: clamps to the oldest keyframe
        assert_eq!(stream.ms_seek(10, &all_tracks()), LivePos::new(100, 1));

        let audio_only: BTreeSet<u32> = [2u32].into_iter().collect();
        assert_eq!(stream.ms_seek(500, &audio_only), LivePos::new(210, 2));
    }

    #[test]
    fn test_can_seek_ms() {
        let mut stream = Stream::new(100, 0);
        assert_eq!(stream.can_seek_ms(0), SeekResult::Unavailable);
        stream.add_packet(video(100, true));
        stream.add_packet(video(200, false));
        assert_eq!(stream.can_seek_ms(150), SeekResult::Exact);
        assert_eq!(stream.can_seek_ms(50), SeekResult::Approximate);
        assert_eq!(stream.can_seek_ms(250), SeekResult::Unavailable);
    }

    #[test]
    fn test_end_stream_starves_drained_rings() {
        let mut stream = Stream::new(100, 0);
        stream.add_packet(video(100, true));
        let ring = stream.get_ring(&all_tracks());
        assert!(!ring.starved());
        stream.end_stream();
        assert!(stream.is_ended());
        assert!(ring.starved());
    }

    #[test]
    fn test_parse_packet_roundtrip() {
        let mut stream = Stream::new(100, 0);
        let mut buffer = Buffer::new();

        let mut meta = StreamMeta::default();
        meta.track_mut(1, TrackKind::Video).codec = "H264".into();
        buffer.append(&frame_header(&meta.to_value()));
        buffer.append(&video(100, true).encode());

        assert!(stream.parse_packet(&mut buffer));
        assert_eq!(stream.meta.track(1).unwrap().codec, "H264");
        assert!(!stream.last_meta_pack.is_empty());
        assert_eq!(stream.packet_count(), 1);
    }

    #[test]
    fn test_parse_packet_partial_input() {
        let mut stream = Stream::new(100, 0);
        let mut buffer = Buffer::new();
        let wire = video(100, true).encode();
        buffer.append(&wire[..wire.len() - 1]);

        assert!(!stream.parse_packet(&mut buffer));
        // nothing consumed: feeding the last byte completes the packet
        buffer.append(&wire[wire.len() - 1..]);
        assert!(stream.parse_packet(&mut buffer));
    }

    #[test]
    fn test_parse_packet_resyncs_on_garbage() {
        let mut stream = Stream::new(100, 0);
        let mut buffer = Buffer::new();
        buffer.append(b"garbage?");
        assert!(!stream.parse_packet(&mut buffer));
        buffer.append(&video(10, true).encode());
        assert!(stream.parse_packet(&mut buffer));
    }

    #[tokio::test]
    async fn test_wait_for_meta() {
        let (mut tx, mut rx) = Socket::pair().unwrap();
        let mut meta = StreamMeta::default();
        meta.track_mut(2, TrackKind::Audio).codec = "AAC".into();
        tx.send_now(&frame_header(&meta.to_value())).await;

        let mut stream = Stream::new(10, 0);
        stream.wait_for_meta(&mut rx).await;
        assert_eq!(stream.meta.track(2).unwrap().codec, "AAC");
    }
}
