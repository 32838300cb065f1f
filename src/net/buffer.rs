//! Segmented byte buffer
//!
//! A FIFO of byte blocks. Appended data is split at newlines (when one occurs
//! within a block) and otherwise every [`BLOCK_SIZE`] bytes, so that
//! line-oriented consumers usually find a complete line in a single block and
//! can take it without copying.
//!
//! `remove` and `copy` are all-or-nothing: if fewer than the requested bytes
//! are queued, nothing is returned and nothing is consumed.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Block granularity for appended data.
pub const BLOCK_SIZE: usize = 4096;

/// Segmented FIFO of byte blocks.
#[derive(Debug, Default)]
pub struct Buffer {
    /// Blocks in FIFO order; the front block is the oldest data.
    blocks: VecDeque<BytesMut>,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            blocks: VecDeque::new(),
        }
    }

    /// Append data, splitting on newlines and every [`BLOCK_SIZE`] bytes.
    pub fn append(&mut self, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let mut j = i;
            while j < data.len() && j - i < BLOCK_SIZE {
                j += 1;
                if data[j - 1] == b'\n' {
                    break;
                }
            }
            if i == j {
                break;
            }
            self.blocks.push_back(BytesMut::from(&data[i..j]));
            i = j;
        }
        if self.blocks.len() > 5000 {
            tracing::warn!(blocks = self.blocks.len(), "receive buffer heavily fragmented");
        }
    }

    /// Put a block back at the front of the FIFO, unsplit.
    pub fn prepend(&mut self, data: &[u8]) {
        self.blocks.push_front(BytesMut::from(data));
    }

    /// Number of non-empty blocks queued.
    ///
    /// Leading empty blocks (fully consumed through [`get`](Self::get)) are
    /// dropped first, so an empty buffer always reports zero.
    pub fn size(&mut self) -> usize {
        while matches!(self.blocks.front(), Some(b) if b.is_empty()) {
            self.blocks.pop_front();
        }
        self.blocks.len()
    }

    /// True if at least `count` bytes are queued.
    pub fn available(&self, count: usize) -> bool {
        let mut total = 0;
        for block in &self.blocks {
            total += block.len();
            if total >= count {
                return true;
            }
        }
        false
    }

    /// Total queued bytes, capped at `max`.
    pub fn bytes(&self, max: usize) -> usize {
        let mut total = 0;
        for block in &self.blocks {
            total += block.len();
            if total >= max {
                return max;
            }
        }
        total
    }

    /// Remove exactly `count` bytes from the front, or nothing at all.
    pub fn remove(&mut self, count: usize) -> Option<Bytes> {
        if !self.available(count) {
            return None;
        }
        let mut out = BytesMut::with_capacity(count);
        let mut needed = count;
        while needed > 0 {
            let front = self.blocks.front_mut()?;
            if front.len() <= needed {
                needed -= front.len();
                out.extend_from_slice(front);
                self.blocks.pop_front();
            } else {
                out.extend_from_slice(&front.split_to(needed));
                needed = 0;
            }
        }
        Some(out.freeze())
    }

    /// Copy exactly `count` bytes from the front without consuming, or nothing.
    pub fn copy(&self, count: usize) -> Option<Bytes> {
        if !self.available(count) {
            return None;
        }
        let mut out = BytesMut::with_capacity(count);
        let mut needed = count;
        for block in &self.blocks {
            if block.len() <= needed {
                out.extend_from_slice(block);
                needed -= block.len();
            } else {
                out.extend_from_slice(&block[..needed]);
                needed = 0;
            }
            if needed == 0 {
                break;
            }
        }
        Some(out.freeze())
    }

    /// Mutable access to the front block for zero-copy consumption.
    ///
    /// An empty block is kept available so callers can always hold a
    /// reference; it is trimmed again by the next [`size`](Self::size) call.
    pub fn get(&mut self) -> &mut BytesMut {
        while self.blocks.len() > 1 && self.blocks.front().map_or(false, |b| b.is_empty()) {
            self.blocks.pop_front();
        }
        if self.blocks.is_empty() {
            self.blocks.push_back(BytesMut::new());
        }
        self.blocks.front_mut().unwrap()
    }

    /// Merge front blocks until the front block ends in a newline.
    ///
    /// Returns true when it does, false when the queued data contains no
    /// newline at all (caller must wait for more input). This is the
    /// accumulate-until-newline rule used by the HTTP reader and proxy.
    pub fn rejoin_until_newline(&mut self) -> bool {
        loop {
            if self.size() == 0 {
                return false;
            }
            if self.blocks.front().map_or(false, |b| b.last() == Some(&b'\n')) {
                return true;
            }
            if self.blocks.len() < 2 {
                return false;
            }
            let head = self.blocks.pop_front().unwrap();
            let mut merged = BytesMut::with_capacity(head.len() + self.blocks[0].len());
            merged.extend_from_slice(&head);
            merged.extend_from_slice(&self.blocks[0]);
            self.blocks[0] = merged;
        }
    }

    /// Drop all queued data.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
