//! Event assembly across continuation segments
//!
//! Physics events may arrive as several entries (possibly in different
//! buffers), each but the last carrying the continuation bit. The formatter
//! appends segments here and takes the finished event when a segment without
//! the bit arrives.

use crate::buffer::words_to_bytes;

/// What happened to an appended segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Segment appended
    Appended,
    /// The held bytes were flushed to make room, then the segment was appended
    Flushed(Vec<u8>),
    /// Segment alone exceeds the capacity; dropped
    Oversize,
}

/// Fixed-capacity byte accumulator
#[derive(Debug)]
pub struct EventAssembly {
    bytes: Vec<u8>,
    capacity: usize,
}

impl EventAssembly {
    /// Assembly holding at most `capacity_words` 16-bit words
    pub fn new(capacity_words: usize) -> Self {
        let capacity = capacity_words * 2;
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append one segment
    pub fn push_segment(&mut self, words: &[u16]) -> SegmentOutcome {
        let needed = words.len() * 2;
        if needed > self.capacity {
            return SegmentOutcome::Oversize;
        }

        let outcome = if self.bytes.len() + needed > self.capacity {
            match self.take() {
                Some(held) => SegmentOutcome::Flushed(held),
                None => SegmentOutcome::Appended,
            }
        } else {
            SegmentOutcome::Appended
        };
        self.bytes.extend_from_slice(&words_to_bytes(words));
        outcome
    }

    /// Take the held bytes, leaving the assembly empty
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.bytes,
            Vec::with_capacity(self.capacity),
        ))
    }

    /// Discard anything held
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
