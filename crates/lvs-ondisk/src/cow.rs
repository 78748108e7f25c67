#![forbid(unsafe_code)]
//! Persistent exception store, format version 1.
//!
//! Layout of a COW device, in chunks:
//!
//! ```text
//! chunk 0                 header (first 16 bytes used)
//! chunk 1                 exception store 0
//! chunks 2 ..= E+1        data chunks for store 0
//! chunk E+2               exception store 1
//! ...
//! ```
//!
//! where `E = chunk_size / 16` is the number of exception records a store
//! holds. All integers are little-endian.

use lvs_types::{
    COW_DISK_MAGIC, COW_DISK_VERSION, COW_EXCEPTION_SIZE, COW_HEADER_SIZE, COW_VALID_FLAG,
    ByteOffset, ChunkIndex, ChunkSize, ParseError, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// The 16-byte header at offset 0 of a COW device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CowHeader {
    pub magic: u32,
    pub valid: u32,
    pub version: u32,
    pub chunk_size_sectors: u32,
}

impl CowHeader {
    /// Parse and validate the header from the start of `region`.
    ///
    /// Checks magic, then the valid flag, then the version; the first
    /// mismatch is reported. The chunk size is not range-checked here.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < COW_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: COW_HEADER_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u32(region, 0)?;
        if magic != COW_DISK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(COW_DISK_MAGIC),
                actual: u64::from(magic),
            });
        }

        let valid = read_le_u32(region, 4)?;
        if valid != COW_VALID_FLAG {
            return Err(ParseError::UnexpectedValue {
                field: "valid",
                expected: u64::from(COW_VALID_FLAG),
                actual: u64::from(valid),
            });
        }

        let version = read_le_u32(region, 8)?;
        if version != COW_DISK_VERSION {
            return Err(ParseError::UnexpectedValue {
                field: "version",
                expected: u64::from(COW_DISK_VERSION),
                actual: u64::from(version),
            });
        }

        Ok(Self {
            magic,
            valid,
            version,
            chunk_size_sectors: read_le_u32(region, 12)?,
        })
    }

    #[must_use]
    pub fn chunk_size(&self) -> ChunkSize {
        ChunkSize::from_sectors(self.chunk_size_sectors)
    }

    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; COW_HEADER_SIZE] {
        let mut out = [0_u8; COW_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.valid.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.chunk_size_sectors.to_le_bytes());
        out
    }
}

/// One exception record: origin chunk `old_chunk` was copied to COW chunk `new_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskException {
    pub old_chunk: u64,
    pub new_chunk: u64,
}

impl DiskException {
    pub const TERMINATOR: Self = Self {
        old_chunk: 0,
        new_chunk: 0,
    };

    /// Parse record `index` of an exception store.
    pub fn parse_at(store: &[u8], index: usize) -> Result<Self, ParseError> {
        let offset = index
            .checked_mul(COW_EXCEPTION_SIZE)
            .ok_or(ParseError::IntegerConversion {
                field: "exception_index",
            })?;
        Ok(Self {
            old_chunk: read_le_u64(store, offset)?,
            new_chunk: read_le_u64(store, offset + 8)?,
        })
    }

    /// A zero `new_chunk` ends the exception chain.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.new_chunk == 0
    }

    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; COW_EXCEPTION_SIZE] {
        let mut out = [0_u8; COW_EXCEPTION_SIZE];
        out[0..8].copy_from_slice(&self.old_chunk.to_le_bytes());
        out[8..16].copy_from_slice(&self.new_chunk.to_le_bytes());
        out
    }
}

/// Placement of exception stores for a given chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreGeometry {
    chunk_size: ChunkSize,
    exceptions_per_chunk: u64,
}

impl StoreGeometry {
    /// Fails when a store could not hold a single record, which includes a
    /// zero chunk size: such a chain can never reach a terminator.
    pub fn new(chunk_size: ChunkSize) -> Result<Self, ParseError> {
        if chunk_size.is_zero() {
            return Err(ParseError::InvalidField {
                field: "chunk_size",
                reason: "zero",
            });
        }
        let exceptions_per_chunk = chunk_size.bytes() / COW_EXCEPTION_SIZE as u64;
        if exceptions_per_chunk == 0 {
            return Err(ParseError::InvalidField {
                field: "chunk_size",
                reason: "too small to hold an exception record",
            });
        }
        Ok(Self {
            chunk_size,
            exceptions_per_chunk,
        })
    }

    #[must_use]
    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    #[must_use]
    pub fn exceptions_per_chunk(&self) -> u64 {
        self.exceptions_per_chunk
    }

    /// Chunk index of exception store `store`: `1 + (E + 1) * store`.
    #[must_use]
    pub fn store_offset_chunks(&self, store: u64) -> Option<ChunkIndex> {
        self.exceptions_per_chunk
            .checked_add(1)?
            .checked_mul(store)?
            .checked_add(1)
            .map(ChunkIndex)
    }

    /// Byte offset of exception store `store`.
    #[must_use]
    pub fn store_byte_offset(&self, store: u64) -> Option<ByteOffset> {
        self.store_offset_chunks(store)?
            .to_byte_offset(self.chunk_size)
    }

    /// True for the header chunk and every exception-store chunk.
    #[must_use]
    pub fn is_metadata_chunk(&self, chunk: ChunkIndex) -> bool {
        match chunk.0.checked_sub(1) {
            None => true,
            Some(rel) => rel % (self.exceptions_per_chunk + 1) == 0,
        }
    }
}
