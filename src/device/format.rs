//! Layout of raw buffers produced by the readout controller
//!
//! ```text
//! word 0        buffer header: bits 0-11 entry count, bit 15 last buffer
//! per entry:    entry header:  bits 0-11 body length in words,
//!                              bit 12 continuation,
//!                              bits 13-15 stack id
//!               body words
//! ```
//!
//! An entry whose continuation bit is set is one segment of an event that
//! continues in the next entry from the same stack, possibly in the next
//! buffer.

use crate::error::{ReadoutError, Result};

/// Mask for the entry count in the buffer header
pub const ENTRY_COUNT_MASK: u16 = 0x0fff;
/// Buffer header bit marking the final buffer after acquisition stops
pub const LAST_BUFFER_BIT: u16 = 0x8000;
/// Mask for the body length in an entry header
pub const ENTRY_LENGTH_MASK: u16 = 0x0fff;
/// Entry header bit: more segments of this event follow
pub const CONTINUATION_BIT: u16 = 0x1000;
/// Shift of the stack id in an entry header
pub const STACK_SHIFT: u16 = 13;
/// Mask (after shifting) of the stack id
pub const STACK_MASK: u16 = 0x7;
/// Largest body an entry can describe
pub const MAX_ENTRY_WORDS: usize = ENTRY_LENGTH_MASK as usize;
/// Largest number of entries a buffer can describe
pub const MAX_ENTRIES: usize = ENTRY_COUNT_MASK as usize;

/// One entry of a raw device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    /// Source stack
    pub stack_id: u8,
    /// More segments of the same event follow
    pub continuation: bool,
    /// Body words (entry header stripped)
    pub body: &'a [u16],
}

/// Whether the buffer header carries the last-buffer marker
pub fn is_last_buffer(words: &[u16]) -> bool {
    words
        .first()
        .is_some_and(|header| header & LAST_BUFFER_BIT != 0)
}

/// Split a raw buffer into entries
///
/// The whole buffer is validated before anything is returned: the entry
/// count in the header must consume exactly the used words.
pub fn parse_entries(words: &[u16]) -> Result<Vec<Entry<'_>>> {
    let Some(&header) = words.first() else {
        return Err(ReadoutError::MalformedBuffer(
            "empty device buffer".to_string(),
        ));
    };
    let count = (header & ENTRY_COUNT_MASK) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 1;

    for index in 0..count {
        let Some(&entry_header) = words.get(pos) else {
            return Err(ReadoutError::MalformedBuffer(format!(
                "header announces {} entries but words ran out at entry {}",
                count, index
            )));
        };
        let len = (entry_header & ENTRY_LENGTH_MASK) as usize;
        let start = pos + 1;
        let end = start + len;
        if end > words.len() {
            return Err(ReadoutError::MalformedBuffer(format!(
                "entry {} needs {} words, only {} remain",
                index,
                len,
                words.len() - start
            )));
        }
        entries.push(Entry {
            stack_id: ((entry_header >> STACK_SHIFT) & STACK_MASK) as u8,
            continuation: entry_header & CONTINUATION_BIT != 0,
            body: &words[start..end],
        });
        pos = end;
    }

    if pos != words.len() {
        return Err(ReadoutError::MalformedBuffer(format!(
            "{} words left over after {} entries",
            words.len() - pos,
            count
        )));
    }
    Ok(entries)
}

/// Incremental builder for raw device buffers
///
/// Used by the simulated device and by tests to produce buffers in the
/// controller's layout.
#[derive(Debug, Clone)]
pub struct DeviceBufferBuilder {
    words: Vec<u16>,
    entries: usize,
    last: bool,
}

impl Default for DeviceBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBufferBuilder {
    pub fn new() -> Self {
        Self {
            words: vec![0],
            entries: 0,
            last: false,
        }
    }

    /// Words the buffer would occupy if finished now
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether no entries have been added
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Append one entry
    pub fn entry(mut self, stack_id: u8, continuation: bool, body: &[u16]) -> Self {
        self.push_entry(stack_id, continuation, body);
        self
    }

    /// Append one entry in place
    pub fn push_entry(&mut self, stack_id: u8, continuation: bool, body: &[u16]) {
        debug_assert!(body.len() <= MAX_ENTRY_WORDS);
        debug_assert!(self.entries < MAX_ENTRIES);
        let mut header = (body.len() as u16) & ENTRY_LENGTH_MASK;
        header |= ((stack_id as u16) & STACK_MASK) << STACK_SHIFT;
        if continuation {
            header |= CONTINUATION_BIT;
        }
        self.words.push(header);
        self.words.extend_from_slice(body);
        self.entries += 1;
    }

    /// Set the last-buffer marker
    pub fn last_buffer(mut self) -> Self {
        self.last = true;
        self
    }

    /// Produce the finished word vector
    pub fn build(mut self) -> Vec<u16> {
        let mut header = (self.entries as u16) & ENTRY_COUNT_MASK;
        if self.last {
            header |= LAST_BUFFER_BIT;
        }
        self.words[0] = header;
        self.words
    }
}
