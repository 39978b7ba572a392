//! Fixed-capacity readout buffers and the pool that recycles them
//!
//! A [`Buffer`] is the unit of hand-off between the acquisition worker and
//! the output formatter. Buffers are allocated once when the
//! [`BufferPool`] is built and are never cloned: ownership moves through the
//! pool's free and filled queues, so at any instant exactly one component
//! holds a given buffer.
//!
//! - [`pool`] - the free/filled queue pair
//! - [`header`] - the legacy 16-word buffer header and its checksum

pub mod header;
pub mod pool;

pub use header::{checksum, LegacyBufferHeader, LegacyBufferType, HEADER_WORDS};
pub use pool::BufferPool;

use crate::error::{ReadoutError, Result};
use crate::types::TextKind;
use chrono::{DateTime, Utc};
use std::time::Instant;

/// What a buffer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferType {
    /// Begin-run marker (no device payload)
    Start,
    /// End-run marker (no device payload)
    Stop,
    /// Pause marker (no device payload)
    Pause,
    /// Resume marker (no device payload)
    Resume,
    /// Raw device data
    #[default]
    Events,
    /// Packed string list
    Strings,
}

impl BufferType {
    /// Whether this is one of the run-state markers
    pub fn is_state_change(self) -> bool {
        matches!(
            self,
            BufferType::Start | BufferType::Stop | BufferType::Pause | BufferType::Resume
        )
    }
}

/// A fixed-capacity block of 16-bit words plus capture metadata
#[derive(Debug)]
pub struct Buffer {
    words: Box<[u16]>,
    used: usize,
    buffer_type: BufferType,
    run_number: u32,
    sequence: u64,
    captured_at: Instant,
    wall_clock: DateTime<Utc>,
}

impl Buffer {
    /// Allocate a buffer with `capacity` words
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            words: vec![0u16; capacity].into_boxed_slice(),
            used: 0,
            buffer_type: BufferType::Events,
            run_number: 0,
            sequence: 0,
            captured_at: Instant::now(),
            wall_clock: Utc::now(),
        }
    }

    /// Capacity in words
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Number of words holding data
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Whether no words are in use
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The used portion of the buffer
    #[inline]
    pub fn as_slice(&self) -> &[u16] {
        &self.words[..self.used]
    }

    /// The whole storage region, for the device to read into
    #[inline]
    pub fn storage_mut(&mut self) -> &mut [u16] {
        &mut self.words
    }

    /// Set the number of words in use after an external fill
    pub fn set_used(&mut self, used: usize) -> Result<()> {
        if used > self.capacity() {
            return Err(ReadoutError::BufferOverflow {
                needed: used,
                capacity: self.capacity(),
            });
        }
        self.used = used;
        Ok(())
    }

    /// Copy `data` into the buffer, replacing its contents
    pub fn fill_from(&mut self, data: &[u16]) -> Result<()> {
        if data.len() > self.capacity() {
            return Err(ReadoutError::BufferOverflow {
                needed: data.len(),
                capacity: self.capacity(),
            });
        }
        self.words[..data.len()].copy_from_slice(data);
        self.used = data.len();
        Ok(())
    }

    /// Buffer type tag
    #[inline]
    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Run number stamped at capture
    #[inline]
    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// Per-run capture sequence number
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Monotonic capture time
    #[inline]
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall-clock capture time
    #[inline]
    pub fn wall_clock(&self) -> DateTime<Utc> {
        self.wall_clock
    }

    /// Tag and timestamp the buffer at the moment of capture
    pub fn stamp(&mut self, buffer_type: BufferType, run_number: u32, sequence: u64) {
        self.stamp_at(buffer_type, run_number, sequence, Instant::now());
    }

    /// Tag the buffer with an explicit monotonic capture time
    pub fn stamp_at(
        &mut self,
        buffer_type: BufferType,
        run_number: u32,
        sequence: u64,
        captured_at: Instant,
    ) {
        self.buffer_type = buffer_type;
        self.run_number = run_number;
        self.sequence = sequence;
        self.captured_at = captured_at;
        self.wall_clock = Utc::now();
    }

    /// Forget contents and metadata before the buffer goes back to the pool
    pub(crate) fn reset(&mut self) {
        self.used = 0;
        self.buffer_type = BufferType::Events;
        self.run_number = 0;
        self.sequence = 0;
    }

    /// Pack a string list into the buffer
    ///
    /// Layout: kind code, string count, then the NUL-terminated UTF-8 bytes
    /// of each string packed little-endian two per word (odd tail padded
    /// with a zero byte).
    pub fn write_strings<S: AsRef<str>>(&mut self, kind: TextKind, strings: &[S]) -> Result<()> {
        let mut bytes = Vec::new();
        for s in strings {
            let s = s.as_ref();
            if s.as_bytes().contains(&0) {
                return Err(ReadoutError::Serialization(
                    "strings may not contain NUL".to_string(),
                ));
            }
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
        }
        if bytes.len() % 2 == 1 {
            bytes.push(0);
        }

        let needed = 2 + bytes.len() / 2;
        if needed > self.capacity() {
            return Err(ReadoutError::BufferOverflow {
                needed,
                capacity: self.capacity(),
            });
        }
        let count = u16::try_from(strings.len()).map_err(|_| {
            ReadoutError::Serialization(format!("too many strings: {}", strings.len()))
        })?;

        self.words[0] = kind.code();
        self.words[1] = count;
        for (slot, pair) in self.words[2..needed].iter_mut().zip(bytes.chunks_exact(2)) {
            *slot = u16::from_le_bytes([pair[0], pair[1]]);
        }
        self.used = needed;
        Ok(())
    }

    /// Unpack a string list written by [`Buffer::write_strings`]
    pub fn read_strings(&self) -> Result<(TextKind, Vec<String>)> {
        let words = self.as_slice();
        if words.len() < 2 {
            return Err(ReadoutError::MalformedBuffer(
                "string buffer shorter than its header".to_string(),
            ));
        }
        let kind = TextKind::from_code(words[0]).ok_or_else(|| {
            ReadoutError::MalformedBuffer(format!("unknown text kind {}", words[0]))
        })?;
        let count = words[1] as usize;

        let bytes: Vec<u8> = words[2..].iter().flat_map(|w| w.to_le_bytes()).collect();
        let strings: Vec<String> = bytes
            .split(|b| *b == 0)
            .take(count)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        if strings.len() != count {
            return Err(ReadoutError::MalformedBuffer(format!(
                "expected {} strings, found {}",
                count,
                strings.len()
            )));
        }
        Ok((kind, strings))
    }
}

/// Pack 16-bit words into little-endian bytes
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}
