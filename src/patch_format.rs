//! BPS patch container: header, action stream and checksum trailer.
//!
//! Layout:
//! ```text
//! "BPS1" | varint source_size | varint target_size | varint metadata_len
//!        | metadata | actions... | crc32 source | crc32 target | crc32 patch
//! ```
//! All three checksums are little-endian CRC32. The patch checksum covers every
//! byte before it.

use crate::error::ApplyError;
use crate::util;

pub const MAGIC: &[u8; 4] = b"BPS1";
pub const TRAILER_LEN: usize = 12;
/// Magic, three one-byte varints and the trailer.
pub const MIN_PATCH_LEN: usize = MAGIC.len() + 3 + TRAILER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SourceRead,
    TargetRead,
    SourceCopy,
    TargetCopy,
}

/// One decoded action. `relative` is the signed cursor jump for the two copy
/// actions, `literal` the inline bytes for `TargetRead`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub action: Action,
    pub length: u64,
    pub relative: i64,
    pub literal: &'a [u8],
}

/// A patch whose container checksum has been verified.
#[derive(Debug, Clone)]
pub struct BpsPatch<'a> {
    pub source_size: u64,
    pub target_size: u64,
    pub metadata: &'a [u8],
    actions: &'a [u8],
    pub source_checksum: u32,
    pub target_checksum: u32,
    pub patch_checksum: u32,
}

impl<'a> BpsPatch<'a> {
    /// Check the container and decode the header. Does not touch the action stream.
    pub fn parse(raw: &'a [u8]) -> Result<Self, ApplyError> {
        if raw.is_empty() {
            return Err(ApplyError::Corrupt("patch is empty".to_string()));
        }
        if raw.len() < MIN_PATCH_LEN {
            return Err(ApplyError::Corrupt(format!(
                "patch is only {} bytes (minimum {})",
                raw.len(),
                MIN_PATCH_LEN
            )));
        }
        if &raw[..MAGIC.len()] != MAGIC {
            return Err(ApplyError::Corrupt("missing BPS1 header".to_string()));
        }

        let trailer = &raw[raw.len() - TRAILER_LEN..];
        let source_checksum = read_u32_le(&trailer[0..4]);
        let target_checksum = read_u32_le(&trailer[4..8]);
        let patch_checksum = read_u32_le(&trailer[8..12]);

        let actual = util::crc32(&raw[..raw.len() - 4]);
        if actual != patch_checksum {
            return Err(ApplyError::Corrupt(format!(
                "patch checksum mismatch: expected {patch_checksum:08x}, got {actual:08x}"
            )));
        }

        let body = &raw[MAGIC.len()..raw.len() - TRAILER_LEN];
        let mut reader = Reader::new(body);
        let source_size = reader.varint()?;
        let target_size = reader.varint()?;
        let metadata_len = reader.varint()?;
        let metadata = reader.take(metadata_len)?;

        Ok(Self {
            source_size,
            target_size,
            metadata,
            actions: reader.rest(),
            source_checksum,
            target_checksum,
            patch_checksum,
        })
    }

    /// Metadata as text, if it is valid UTF-8 and non-empty.
    pub fn metadata_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.metadata)
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn instructions(&self) -> Instructions<'a> {
        Instructions {
            reader: Reader::new(self.actions),
        }
    }
}

/// Lazily decodes the action stream. Yields `None` once the stream is
/// exhausted; a partially encoded action is an error.
pub struct Instructions<'a> {
    reader: Reader<'a>,
}

impl<'a> Instructions<'a> {
    /// Bytes of the action stream not yet decoded.
    pub fn remaining(&self) -> usize {
        self.reader.rest().len()
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ApplyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.rest().is_empty() {
            return None;
        }
        Some(decode_instruction(&mut self.reader))
    }
}

fn decode_instruction<'a>(reader: &mut Reader<'a>) -> Result<Instruction<'a>, ApplyError> {
    let word = reader.varint()?;
    // Encoded length 0 means a run of one byte.
    let length = (word >> 2) + 1;
    let action = match word & 3 {
        0 => Action::SourceRead,
        1 => Action::TargetRead,
        2 => Action::SourceCopy,
        _ => Action::TargetCopy,
    };

    let mut instruction = Instruction {
        action,
        length,
        relative: 0,
        literal: &[],
    };
    match action {
        Action::SourceRead => {}
        Action::TargetRead => instruction.literal = reader.take(length)?,
        Action::SourceCopy | Action::TargetCopy => instruction.relative = reader.signed()?,
    }
    Ok(instruction)
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Cursor over the patch body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn byte(&mut self) -> Result<u8, ApplyError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ApplyError::Corrupt("unexpected end of patch data".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8], ApplyError> {
        let available = self.data.len() - self.pos;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= available)
            .ok_or_else(|| {
                ApplyError::Corrupt(format!(
                    "run of {len} bytes overruns patch data ({available} left)"
                ))
            })?;
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// BPS varint: little-endian 7-bit groups, high bit terminates, and every
    /// continuation adds the next group's base so each value has one encoding.
    fn varint(&mut self) -> Result<u64, ApplyError> {
        let overflow = || ApplyError::Corrupt("varint overflows 64 bits".to_string());
        let mut data: u64 = 0;
        let mut shift: u64 = 1;
        loop {
            let b = self.byte()?;
            let group = u64::from(b & 0x7f).checked_mul(shift).ok_or_else(overflow)?;
            data = data.checked_add(group).ok_or_else(overflow)?;
            if b & 0x80 != 0 {
                return Ok(data);
            }
            shift = shift.checked_shl(7).filter(|&s| s != 0).ok_or_else(overflow)?;
            if shift > 1 << 56 {
                return Err(overflow());
            }
            data = data.checked_add(shift).ok_or_else(overflow)?;
        }
    }

    fn signed(&mut self) -> Result<i64, ApplyError> {
        let raw = self.varint()?;
        let magnitude = (raw >> 1) as i64;
        Ok(if raw & 1 != 0 { -magnitude } else { magnitude })
    }
}
