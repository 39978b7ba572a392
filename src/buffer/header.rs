//! Legacy 16-word buffer header
//!
//! Older analysis software reads fixed-size buffers that start with this
//! header. Multi-word fields are stored low word first.
//!
//! | word  | field                          |
//! |-------|--------------------------------|
//! | 0     | used size in words (incl. hdr) |
//! | 1     | buffer type                    |
//! | 2     | checksum                       |
//! | 3     | run number                     |
//! | 4-5   | sequence (32-bit)              |
//! | 6     | entity count                   |
//! | 7     | reserved                       |
//! | 8     | cpu id                         |
//! | 9     | reserved                       |
//! | 10    | format revision                |
//! | 11    | short signature `0x0102`       |
//! | 12-13 | long signature `0x01020304`    |
//! | 14-15 | reserved                       |
//!
//! The checksum word holds the negated 16-bit sum of every other used word,
//! so the whole used buffer sums to zero.

use crate::error::{ReadoutError, Result};
use serde::{Deserialize, Serialize};

/// Header length in words
pub const HEADER_WORDS: usize = 16;
/// Format revision written into new headers
pub const FORMAT_REVISION: u16 = 5;
/// Short byte-order signature
pub const SHORT_SIGNATURE: u16 = 0x0102;
/// Long byte-order signature
pub const LONG_SIGNATURE: u32 = 0x0102_0304;

const CHECKSUM_WORD: usize = 2;

/// Buffer type codes understood by legacy readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegacyBufferType {
    Data,
    Scaler,
    SnapshotScaler,
    StateVariables,
    RunVariables,
    PacketDocumentation,
    BeginRun,
    EndRun,
    PauseRun,
    ResumeRun,
}

impl LegacyBufferType {
    pub fn code(self) -> u16 {
        match self {
            LegacyBufferType::Data => 1,
            LegacyBufferType::Scaler => 2,
            LegacyBufferType::SnapshotScaler => 3,
            LegacyBufferType::StateVariables => 4,
            LegacyBufferType::RunVariables => 5,
            LegacyBufferType::PacketDocumentation => 6,
            LegacyBufferType::BeginRun => 11,
            LegacyBufferType::EndRun => 12,
            LegacyBufferType::PauseRun => 13,
            LegacyBufferType::ResumeRun => 14,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => LegacyBufferType::Data,
            2 => LegacyBufferType::Scaler,
            3 => LegacyBufferType::SnapshotScaler,
            4 => LegacyBufferType::StateVariables,
            5 => LegacyBufferType::RunVariables,
            6 => LegacyBufferType::PacketDocumentation,
            11 => LegacyBufferType::BeginRun,
            12 => LegacyBufferType::EndRun,
            13 => LegacyBufferType::PauseRun,
            14 => LegacyBufferType::ResumeRun,
            _ => return None,
        })
    }
}

/// Decoded header fields (signatures and revision are implied)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyBufferHeader {
    pub size: u16,
    pub buffer_type: LegacyBufferType,
    pub checksum: u16,
    pub run_number: u16,
    pub sequence: u32,
    pub entity_count: u16,
    pub cpu_id: u16,
}

impl LegacyBufferHeader {
    /// Header for a new buffer; size and checksum are filled in by
    /// [`finalize`]
    pub fn new(buffer_type: LegacyBufferType, run_number: u16, sequence: u32) -> Self {
        Self {
            size: HEADER_WORDS as u16,
            buffer_type,
            checksum: 0,
            run_number,
            sequence,
            entity_count: 0,
            cpu_id: 0,
        }
    }

    /// Serialize into the first [`HEADER_WORDS`] words of `out`
    pub fn encode(&self, out: &mut [u16]) -> Result<()> {
        if out.len() < HEADER_WORDS {
            return Err(ReadoutError::BufferOverflow {
                needed: HEADER_WORDS,
                capacity: out.len(),
            });
        }
        let [seq_lo, seq_hi] = split_u32(self.sequence);
        let [sig_lo, sig_hi] = split_u32(LONG_SIGNATURE);
        out[..HEADER_WORDS].copy_from_slice(&[
            self.size,
            self.buffer_type.code(),
            self.checksum,
            self.run_number,
            seq_lo,
            seq_hi,
            self.entity_count,
            0,
            self.cpu_id,
            0,
            FORMAT_REVISION,
            SHORT_SIGNATURE,
            sig_lo,
            sig_hi,
            0,
            0,
        ]);
        Ok(())
    }

    /// Parse a header, validating signatures and type code
    pub fn decode(words: &[u16]) -> Result<Self> {
        if words.len() < HEADER_WORDS {
            return Err(ReadoutError::MalformedBuffer(format!(
                "legacy buffer shorter than its header ({} words)",
                words.len()
            )));
        }
        if words[11] != SHORT_SIGNATURE || join_u32(words[12], words[13]) != LONG_SIGNATURE {
            return Err(ReadoutError::MalformedBuffer(
                "legacy buffer signatures do not match (byte order?)".to_string(),
            ));
        }
        let buffer_type = LegacyBufferType::from_code(words[1]).ok_or_else(|| {
            ReadoutError::MalformedBuffer(format!("unknown legacy buffer type {}", words[1]))
        })?;

        Ok(Self {
            size: words[0],
            buffer_type,
            checksum: words[CHECKSUM_WORD],
            run_number: words[3],
            sequence: join_u32(words[4], words[5]),
            entity_count: words[6],
            cpu_id: words[8],
        })
    }
}

/// Negated 16-bit sum of `words`, treating the checksum slot as zero
pub fn checksum(words: &[u16]) -> u16 {
    words
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_WORD)
        .fold(0u16, |acc, (_, w)| acc.wrapping_add(*w))
        .wrapping_neg()
}

/// Wrapping 16-bit sum of every word
pub fn word_sum(words: &[u16]) -> u16 {
    words.iter().fold(0u16, |acc, w| acc.wrapping_add(*w))
}

/// Write size and checksum into an encoded buffer of `used` words
pub fn finalize(buffer: &mut [u16], used: usize) -> Result<()> {
    if used < HEADER_WORDS || used > buffer.len() {
        return Err(ReadoutError::BufferOverflow {
            needed: used,
            capacity: buffer.len(),
        });
    }
    buffer[0] = u16::try_from(used).map_err(|_| ReadoutError::BufferOverflow {
        needed: used,
        capacity: u16::MAX as usize,
    })?;
    buffer[CHECKSUM_WORD] = 0;
    buffer[CHECKSUM_WORD] = checksum(&buffer[..used]);
    Ok(())
}

/// Validate a complete legacy buffer and split it into header and body
pub fn decode_legacy_buffer(words: &[u16]) -> Result<(LegacyBufferHeader, &[u16])> {
    let header = LegacyBufferHeader::decode(words)?;
    let used = header.size as usize;
    if used < HEADER_WORDS || used > words.len() {
        return Err(ReadoutError::MalformedBuffer(format!(
            "legacy size field {} outside 16..={}",
            used,
            words.len()
        )));
    }
    if word_sum(&words[..used]) != 0 {
        return Err(ReadoutError::MalformedBuffer(
            "legacy buffer checksum mismatch".to_string(),
        ));
    }
    Ok((header, &words[HEADER_WORDS..used]))
}

/// Split a 32-bit value into (low, high) words
#[inline]
pub fn split_u32(value: u32) -> [u16; 2] {
    [(value & 0xffff) as u16, (value >> 16) as u16]
}

/// Join (low, high) words into a 32-bit value
#[inline]
pub fn join_u32(low: u16, high: u16) -> u32 {
    (low as u32) | ((high as u32) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(body: &[u16], header: LegacyBufferHeader) -> Vec<u16> {
        let mut words = vec![0u16; HEADER_WORDS + body.len()];
        header.encode(&mut words).unwrap();
        words[HEADER_WORDS..].copy_from_slice(body);
        let used = words.len();
        finalize(&mut words, used).unwrap();
        words
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = LegacyBufferHeader::new(LegacyBufferType::Scaler, 17, 0x0001_0002);
        header.entity_count = 4;
        header.cpu_id = 3;
        let words = encoded(&[1, 2, 3], header);

        let (decoded, body) = decode_legacy_buffer(&words).unwrap();
        assert_eq!(decoded.buffer_type, LegacyBufferType::Scaler);
        assert_eq!(decoded.run_number, 17);
        assert_eq!(decoded.sequence, 0x0001_0002);
        assert_eq!(decoded.entity_count, 4);
        assert_eq!(decoded.cpu_id, 3);
        assert_eq!(decoded.size as usize, HEADER_WORDS + 3);
        assert_eq!(body, &[1, 2, 3]);
    }

    #[test]
    fn test_signature_words() {
        let words = encoded(&[], LegacyBufferHeader::new(LegacyBufferType::Data, 1, 0));
        assert_eq!(words[10], FORMAT_REVISION);
        assert_eq!(words[11], 0x0102);
        assert_eq!(words[12], 0x0304);
        assert_eq!(words[13], 0x0102);
    }

    #[test]
    fn test_corrupted_word_fails_checksum() {
        let header = LegacyBufferHeader::new(LegacyBufferType::Data, 1, 0);
        let mut words = encoded(&[10, 20, 30], header);
        words[HEADER_WORDS + 1] ^= 0x0040;
        assert!(decode_legacy_buffer(&words).is_err());
    }

    #[test]
    fn test_swapped_bytes_rejected() {
        let words = encoded(&[], LegacyBufferHeader::new(LegacyBufferType::Data, 1, 0));
        let swapped: Vec<u16> = words.iter().map(|w| w.swap_bytes()).collect();
        assert!(LegacyBufferHeader::decode(&swapped).is_err());
    }

    #[test]
    fn test_finalize_rejects_short_buffers() {
        let mut words = vec![0u16; 8];
        assert!(finalize(&mut words, 8).is_err());
    }

    #[test]
    fn test_split_join() {
        assert_eq!(split_u32(0x0102_0304), [0x0304, 0x0102]);
        assert_eq!(join_u32(0x0304, 0x0102), 0x0102_0304);
    }

    proptest! {
        #[test]
        fn test_checksummed_buffer_sums_to_zero(
            body in prop::collection::vec(any::<u16>(), 0..512),
            run in any::<u16>(),
            sequence in any::<u32>(),
        ) {
            let header = LegacyBufferHeader::new(LegacyBufferType::Data, run, sequence);
            let words = encoded(&body, header);
            prop_assert_eq!(word_sum(&words), 0);
            prop_assert!(decode_legacy_buffer(&words).is_ok());
        }
    }
}
