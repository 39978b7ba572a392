//! Sink writing fixed-size buffers with the legacy 16-word header
//!
//! Older analysis software reads a stream of equal-sized buffers, each with
//! a [`LegacyBufferHeader`] and a checksum. Records map onto buffer types as
//! follows:
//!
//! | record       | buffer type   | body                                    |
//! |--------------|---------------|-----------------------------------------|
//! | PhysicsEvent | Data (1)      | per event: inclusive word count, words  |
//! | Scaler       | Scaler (2)    | end(32), 3 unused, start(32), 3 unused, counters(32 each) |
//! | StateChange  | 11-14         | 80-byte title, elapsed(32), calendar time (7 words) |
//! | Text         | 4-6           | NUL-terminated strings                  |
//!
//! Physics events are packed several per data buffer; a data buffer is
//! written when the next event does not fit, when any other record arrives,
//! or on flush. A partial data buffer is lost unless the sink is flushed.
//! Count records have no legacy form and are skipped.

use super::record::{OutputRecord, StateChangeKind};
use super::sink::RecordSink;
use crate::buffer::header::{
    finalize, split_u32, LegacyBufferHeader, LegacyBufferType, HEADER_WORDS,
};
use crate::buffer::words_to_bytes;
use crate::error::{ReadoutError, Result, ResultExt};
use crate::types::TextKind;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Bytes reserved for the run title
pub const TITLE_BYTES: usize = 80;

/// Words of calendar time in a state-change body
pub const CALENDAR_WORDS: usize = 7;

/// Smallest buffer that can hold a state-change record
pub const MIN_BUFFER_WORDS: usize = HEADER_WORDS + TITLE_BYTES / 2 + 2 + CALENDAR_WORDS;

/// Record sink producing legacy buffers
pub struct LegacyBufferSink<W: Write> {
    writer: W,
    buffer_words: usize,
    /// Body of the data buffer being filled
    data: Vec<u16>,
    data_events: u16,
    data_run: u16,
    sequence: u32,
    buffers_written: u64,
    scratch: Vec<u16>,
}

impl LegacyBufferSink<BufWriter<File>> {
    /// Create (or truncate) a legacy event file
    pub fn create(path: impl AsRef<Path>, buffer_words: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Creating output directory {:?}", parent))?;
            }
        }
        let file =
            File::create(path).with_context(|| format!("Creating event file {:?}", path))?;
        tracing::info!(buffer_words, "Writing legacy buffers to {:?}", path);
        Self::new(BufWriter::new(file), buffer_words)
    }
}

impl<W: Write> LegacyBufferSink<W> {
    pub fn new(writer: W, buffer_words: usize) -> Result<Self> {
        if buffer_words < MIN_BUFFER_WORDS || buffer_words > u16::MAX as usize {
            return Err(ReadoutError::Config(format!(
                "legacy buffers need {}..={} words, got {}",
                MIN_BUFFER_WORDS,
                u16::MAX,
                buffer_words
            )));
        }
        Ok(Self {
            writer,
            buffer_words,
            data: Vec::with_capacity(buffer_words - HEADER_WORDS),
            data_events: 0,
            data_run: 0,
            sequence: 0,
            buffers_written: 0,
            scratch: vec![0; buffer_words],
        })
    }

    /// Buffers written so far
    pub fn buffers_written(&self) -> u64 {
        self.buffers_written
    }

    /// Give back the underlying writer, writing any partial data buffer
    pub fn into_inner(mut self) -> Result<W> {
        self.flush_data()?;
        self.writer.flush().context("Flushing legacy buffers")?;
        Ok(self.writer)
    }

    fn body_capacity(&self) -> usize {
        self.buffer_words - HEADER_WORDS
    }

    /// Write one complete buffer
    fn emit(
        &mut self,
        buffer_type: LegacyBufferType,
        run_number: u16,
        entity_count: u16,
        body: &[u16],
    ) -> Result<()> {
        let used = HEADER_WORDS + body.len();
        if used > self.buffer_words {
            return Err(ReadoutError::BufferOverflow {
                needed: used,
                capacity: self.buffer_words,
            });
        }

        let mut words = std::mem::take(&mut self.scratch);
        let mut header = LegacyBufferHeader::new(buffer_type, run_number, self.sequence);
        header.entity_count = entity_count;
        let written = self.write_buffer(&mut words, &header, body);
        self.scratch = words;
        written?;

        self.sequence = self.sequence.wrapping_add(1);
        self.buffers_written += 1;
        Ok(())
    }

    fn write_buffer(
        &mut self,
        words: &mut [u16],
        header: &LegacyBufferHeader,
        body: &[u16],
    ) -> Result<()> {
        let used = HEADER_WORDS + body.len();
        words.fill(0);
        header.encode(words)?;
        words[HEADER_WORDS..used].copy_from_slice(body);
        finalize(words, used)?;
        self.writer
            .write_all(&words_to_bytes(words))
            .context("Writing legacy buffer")
    }

    /// Write the pending data buffer, if any
    fn flush_data(&mut self) -> Result<()> {
        if self.data_events == 0 {
            return Ok(());
        }
        let body = std::mem::take(&mut self.data);
        let result = self.emit(
            LegacyBufferType::Data,
            self.data_run,
            self.data_events,
            &body,
        );
        self.data = body;
        self.data.clear();
        self.data_events = 0;
        result
    }

    fn add_event(&mut self, run_number: u16, payload: &[u8]) -> Result<()> {
        let words = bytes_to_words(payload);
        let needed = words.len() + 1;
        if needed > self.body_capacity() {
            return Err(ReadoutError::BufferOverflow {
                needed: HEADER_WORDS + needed,
                capacity: self.buffer_words,
            }
            .with_context("physics event larger than a legacy buffer"));
        }
        if self.data_events > 0
            && (run_number != self.data_run
                || self.data.len() + needed > self.body_capacity()
                || self.data_events == u16::MAX)
        {
            self.flush_data()?;
        }

        self.data_run = run_number;
        self.data.push(needed as u16);
        self.data.extend_from_slice(&words);
        self.data_events += 1;
        Ok(())
    }

    fn add_scaler(
        &mut self,
        run_number: u16,
        interval_start: u64,
        interval_end: u64,
        counters: &[u32],
    ) -> Result<()> {
        let count = u16::try_from(counters.len()).map_err(|_| ReadoutError::BufferOverflow {
            needed: counters.len(),
            capacity: u16::MAX as usize,
        })?;
        let mut body = Vec::with_capacity(10 + counters.len() * 2);
        body.extend_from_slice(&split_u32(saturate_u32(interval_end)));
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&split_u32(saturate_u32(interval_start)));
        body.extend_from_slice(&[0, 0, 0]);
        for counter in counters {
            body.extend_from_slice(&split_u32(*counter));
        }
        self.emit(LegacyBufferType::Scaler, run_number, count, &body)
    }

    fn add_state_change(
        &mut self,
        kind: StateChangeKind,
        run_number: u16,
        title: &str,
        elapsed_seconds: u64,
        wall_clock: &DateTime<Utc>,
    ) -> Result<()> {
        let buffer_type = match kind {
            StateChangeKind::Begin => LegacyBufferType::BeginRun,
            StateChangeKind::End => LegacyBufferType::EndRun,
            StateChangeKind::Pause => LegacyBufferType::PauseRun,
            StateChangeKind::Resume => LegacyBufferType::ResumeRun,
        };

        let mut title_bytes = [0u8; TITLE_BYTES];
        let raw = title.as_bytes();
        let n = raw.len().min(TITLE_BYTES);
        title_bytes[..n].copy_from_slice(&raw[..n]);

        let mut body = bytes_to_words(&title_bytes);
        body.extend_from_slice(&split_u32(saturate_u32(elapsed_seconds)));
        body.extend_from_slice(&calendar_words(wall_clock));
        self.emit(buffer_type, run_number, 0, &body)
    }

    /// Pack strings, spilling into further buffers when one fills up
    fn add_text(&mut self, run_number: u16, kind: TextKind, strings: &[String]) -> Result<()> {
        let buffer_type = LegacyBufferType::from_code(kind.code()).ok_or_else(|| {
            ReadoutError::Serialization(format!("no legacy buffer type for {}", kind))
        })?;

        let mut bytes: Vec<u8> = Vec::new();
        let mut count: u16 = 0;
        for s in strings {
            let entry_len = s.len() + 1;
            let padded = |len: usize| (len + 1) / 2;
            if padded(entry_len) > self.body_capacity() {
                return Err(ReadoutError::BufferOverflow {
                    needed: HEADER_WORDS + padded(entry_len),
                    capacity: self.buffer_words,
                }
                .with_context("string larger than a legacy buffer"));
            }
            if count > 0 && padded(bytes.len() + entry_len) > self.body_capacity() {
                self.emit(buffer_type, run_number, count, &bytes_to_words(&bytes))?;
                bytes.clear();
                count = 0;
            }
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
            count += 1;
        }
        self.emit(buffer_type, run_number, count, &bytes_to_words(&bytes))
    }
}

impl<W: Write + Send> RecordSink for LegacyBufferSink<W> {
    fn commit(&mut self, record: &OutputRecord) -> Result<()> {
        let run_number = record.run_number() as u16;
        match record {
            OutputRecord::PhysicsEvent { payload, .. } => self.add_event(run_number, payload),
            OutputRecord::Count { .. } => Ok(()),
            OutputRecord::Scaler {
                interval_start,
                interval_end,
                counters,
                ..
            } => {
                self.flush_data()?;
                self.add_scaler(run_number, *interval_start, *interval_end, counters)
            }
            OutputRecord::StateChange {
                kind,
                title,
                elapsed_seconds,
                wall_clock,
                ..
            } => {
                self.flush_data()?;
                self.add_state_change(*kind, run_number, title, *elapsed_seconds, wall_clock)?;
                if *kind == StateChangeKind::End {
                    self.writer.flush().context("Flushing legacy buffers")?;
                }
                Ok(())
            }
            OutputRecord::Text { kind, strings, .. } => {
                self.flush_data()?;
                self.add_text(run_number, *kind, strings)
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_data()?;
        self.writer.flush().context("Flushing legacy buffers")
    }
}

/// Split a legacy stream into its fixed-size buffers
pub fn read_legacy_stream<R: Read>(mut reader: R, buffer_words: usize) -> Result<Vec<Vec<u16>>> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .context("Reading legacy stream")?;
    let buffer_bytes = buffer_words * 2;
    if buffer_bytes == 0 || bytes.len() % buffer_bytes != 0 {
        return Err(ReadoutError::MalformedBuffer(format!(
            "stream of {} bytes is not a whole number of {}-word buffers",
            bytes.len(),
            buffer_words
        )));
    }
    Ok(bytes
        .chunks_exact(buffer_bytes)
        .map(bytes_to_words)
        .collect())
}

/// Pack bytes into little-endian words, padding an odd tail with zero
fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Month, day, year, hours, minutes, seconds, tenths
fn calendar_words(time: &DateTime<Utc>) -> [u16; CALENDAR_WORDS] {
    [
        time.month() as u16,
        time.day() as u16,
        time.year().clamp(0, u16::MAX as i32) as u16,
        time.hour() as u16,
        time.minute() as u16,
        time.second() as u16,
        (time.nanosecond() / 100_000_000).min(9) as u16,
    ]
}
