#![forbid(unsafe_code)]
//! Shared units, on-disk constants, and byte-parsing helpers.
//!
//! Everything here is I/O-free. Parsing failures are reported as
//! [`ParseError`]; the runtime error type lives in `lvs-error` and the
//! conversion between the two happens in `lvs-core`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// `SNAPSHOT_DISK_MAGIC` from the kernel's persistent exception store ("SnAp").
pub const COW_DISK_MAGIC: u32 = 0x7041_6E53;
pub const COW_DISK_VERSION: u32 = 1;
pub const COW_VALID_FLAG: u32 = 1;

/// On-disk size of the COW header: four little-endian u32 fields.
pub const COW_HEADER_SIZE: usize = 16;
/// On-disk size of one exception record: two little-endian u64 fields.
pub const COW_EXCEPTION_SIZE: usize = 16;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// Byte offset on a device.
///
/// Unit-carrying wrapper to keep byte offsets and chunk indices apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Index of a chunk on the COW device (chunk 0 holds the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkIndex(pub u64);

impl ChunkIndex {
    /// Byte offset of the start of this chunk, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, chunk_size: ChunkSize) -> Option<ByteOffset> {
        self.0.checked_mul(chunk_size.bytes()).map(ByteOffset)
    }
}

/// Chunk size of a COW device, carried in bytes.
///
/// The header stores it in 512-byte sectors; the byte value is always
/// `sectors << SECTOR_SHIFT`. Zero is representable because the header
/// parser accepts it; consumers that iterate stores must reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkSize(u64);

impl ChunkSize {
    #[must_use]
    pub fn from_sectors(sectors: u32) -> Self {
        Self(u64::from(sectors) << SECTOR_SHIFT)
    }

    /// Chunk size from a raw byte count (test geometries use sub-sector chunks).
    #[must_use]
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn bytes(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn sectors(self) -> u64 {
        self.0 >> SECTOR_SHIFT
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Chunk size as an in-memory buffer length.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        u64_to_usize(self.0, "chunk_size")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field}: expected {expected}, got {actual}")]
    UnexpectedValue {
        field: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Round `value` up to a multiple of `alignment` (non-zero power of two).
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
