//! Exception chain walker.
//!
//! Yields one [`CowException`] per live exception, in store order and then
//! record order. The walk ends at the first record whose `new_chunk` is
//! zero, even mid-store; records after it are never decoded.
//!
//! Termination depends on data, so the walker also bounds itself:
//!
//! - a store that would extend past the end of the device is an error;
//! - an optional `max_stores` limit yields [`LvsError::ChainLimit`];
//! - a `new_chunk` that names a metadata chunk or lies past the device end
//!   is an error, so nothing downstream can be pointed at metadata.
//!
//! A failed store read is reported as [`LvsError::ScrubFailed`] carrying the
//! store's byte offset.
//!
//! After yielding an error, or reaching the terminator, the walker only
//! returns `None`.

use crate::metadata_error;
use lvs_block::BlockAccessor;
use lvs_error::{LvsError, Result};
use lvs_ondisk::{DiskException, StoreGeometry};
use lvs_types::{ByteOffset, ChunkIndex, ChunkSize, u64_to_usize};
use serde::Serialize;
use std::iter::FusedIterator;
use tracing::{debug, trace};

/// A live exception and where its data chunk lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CowException {
    pub store: u64,
    pub entry: u64,
    pub old_chunk: ChunkIndex,
    pub new_chunk: ChunkIndex,
    /// Byte offset of the data chunk on the COW device.
    pub offset: ByteOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    store: u64,
    entry: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    /// `store_buf` does not hold the cursor's store yet.
    NeedStore,
    Scanning,
    Finished,
}

pub struct ExceptionWalker<'a> {
    device: &'a dyn BlockAccessor,
    geometry: StoreGeometry,
    max_stores: Option<u64>,
    cursor: Cursor,
    state: WalkState,
    store_buf: Vec<u8>,
    stores_visited: u64,
}

impl<'a> ExceptionWalker<'a> {
    /// Fails if `chunk_size` cannot hold a record (including zero), or if
    /// the first store does not fit on the device. The store buffer is only
    /// allocated once its size is known to be bounded by the device.
    pub fn new(
        device: &'a dyn BlockAccessor,
        chunk_size: ChunkSize,
        max_stores: Option<u64>,
    ) -> Result<Self> {
        let geometry = StoreGeometry::new(chunk_size).map_err(metadata_error)?;
        let first_store_fits = geometry
            .store_byte_offset(0)
            .and_then(|off| off.checked_add(chunk_size.bytes()))
            .is_some_and(|end| end.0 <= device.len_bytes());
        if !first_store_fits {
            return Err(LvsError::MetadataInvalid(format!(
                "chunk size {} leaves no room for an exception store on a {}-byte device",
                chunk_size.bytes(),
                device.len_bytes()
            )));
        }
        let store_len = chunk_size.to_usize().map_err(metadata_error)?;
        debug!(
            chunk_size = chunk_size.bytes(),
            exceptions_per_chunk = geometry.exceptions_per_chunk(),
            "exception walk starting"
        );
        Ok(Self {
            device,
            geometry,
            max_stores,
            cursor: Cursor { store: 0, entry: 0 },
            state: WalkState::NeedStore,
            store_buf: vec![0_u8; store_len],
            stores_visited: 0,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> StoreGeometry {
        self.geometry
    }

    /// Number of stores read so far.
    #[must_use]
    pub fn stores_visited(&self) -> u64 {
        self.stores_visited
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == WalkState::Finished
    }

    fn load_store(&mut self) -> Result<()> {
        let store = self.cursor.store;
        if let Some(limit) = self.max_stores {
            if store >= limit {
                return Err(LvsError::ChainLimit { stores: limit });
            }
        }

        let chunk_size = self.geometry.chunk_size().bytes();
        let offset = self
            .geometry
            .store_byte_offset(store)
            .filter(|off| {
                off.checked_add(chunk_size)
                    .is_some_and(|end| end.0 <= self.device.len_bytes())
            })
            .ok_or_else(|| {
                LvsError::MetadataInvalid(format!(
                    "exception chain runs past end of device without terminator (store {store})"
                ))
            })?;

        let store_buf = &mut self.store_buf;
        self.device
            .aligned(offset.0)
            .and_then(|at| self.device.read_at(at, store_buf))
            .map_err(|source| LvsError::ScrubFailed {
                offset: offset.0,
                source: Box::new(source),
            })?;
        self.stores_visited += 1;
        debug!(store, offset = offset.0, "read exception store");
        Ok(())
    }

    fn locate(&self, record: DiskException) -> Result<CowException> {
        let new_chunk = ChunkIndex(record.new_chunk);
        let chunk_size = self.geometry.chunk_size();
        if self.geometry.is_metadata_chunk(new_chunk) {
            return Err(LvsError::MetadataInvalid(format!(
                "exception {}/{} points at metadata chunk {new_chunk}",
                self.cursor.store, self.cursor.entry
            )));
        }
        let offset = new_chunk
            .to_byte_offset(chunk_size)
            .filter(|off| {
                off.checked_add(chunk_size.bytes())
                    .is_some_and(|end| end.0 <= self.device.len_bytes())
            })
            .ok_or_else(|| {
                LvsError::MetadataInvalid(format!(
                    "exception {}/{} points past end of device (chunk {new_chunk})",
                    self.cursor.store, self.cursor.entry
                ))
            })?;

        Ok(CowException {
            store: self.cursor.store,
            entry: self.cursor.entry,
            old_chunk: ChunkIndex(record.old_chunk),
            new_chunk,
            offset,
        })
    }

    fn step(&mut self) -> Result<Option<CowException>> {
        loop {
            match self.state {
                WalkState::Finished => return Ok(None),
                WalkState::NeedStore => {
                    self.load_store()?;
                    self.state = WalkState::Scanning;
                }
                WalkState::Scanning => {}
            }

            if self.cursor.entry == self.geometry.exceptions_per_chunk() {
                trace!(store = self.cursor.store, "store full, advancing");
                self.cursor = Cursor {
                    store: self.cursor.store + 1,
                    entry: 0,
                };
                self.state = WalkState::NeedStore;
                continue;
            }

            let index = u64_to_usize(self.cursor.entry, "exception_index").map_err(metadata_error)?;
            let record = DiskException::parse_at(&self.store_buf, index).map_err(metadata_error)?;
            if record.is_terminator() {
                debug!(
                    store = self.cursor.store,
                    entry = self.cursor.entry,
                    "exception chain terminator"
                );
                self.state = WalkState::Finished;
                return Ok(None);
            }

            let exception = self.locate(record)?;
            self.cursor.entry += 1;
            return Ok(Some(exception));
        }
    }
}

impl Iterator for ExceptionWalker<'_> {
    type Item = Result<CowException>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(exception)) => Some(Ok(exception)),
            Ok(None) => None,
            Err(err) => {
                self.state = WalkState::Finished;
                Some(Err(err))
            }
        }
    }
}

impl FusedIterator for ExceptionWalker<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use lvs_block::{BlockSize, MemoryBlockDevice};

    fn put(dev: &mut [u8], offset: usize, records: &[(u64, u64)]) {
        for (i, (old, new)) in records.iter().enumerate() {
            let rec = DiskException {
                old_chunk: *old,
                new_chunk: *new,
            };
            let at = offset + i * 16;
            dev[at..at + 16].copy_from_slice(&rec.to_le_bytes());
        }
    }

    fn device_64(chunks: usize, stores: &[(usize, &[(u64, u64)])]) -> MemoryBlockDevice {
        let mut bytes = vec![0_u8; chunks * 64];
        for (chunk, records) in stores {
            put(&mut bytes, chunk * 64, records);
        }
        MemoryBlockDevice::from_bytes(bytes, BlockSize::new(64).expect("bs"))
    }

    fn offsets(walker: ExceptionWalker<'_>) -> Result<Vec<u64>> {
        walker.map(|ex| ex.map(|ex| ex.offset.0)).collect()
    }

    #[test]
    fn terminator_mid_store_stops_walk() {
        // Fourth record points at metadata chunk 6; decoding it would error.
        let dev = device_64(8, &[(1, &[(1, 2), (3, 4), (0, 0), (5, 6)])]);
        let walker = ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        assert_eq!(offsets(walker).expect("walk"), vec![128, 256]);
        assert_eq!(dev.read_calls(), 1);
    }

    #[test]
    fn full_store_advances_to_next() {
        // Store 0 at chunk 1 is full; store 1 at chunk 6 holds one more.
        let dev = device_64(
            12,
            &[
                (1, &[(10, 2), (11, 3), (12, 4), (13, 5)]),
                (6, &[(14, 7), (0, 0)]),
            ],
        );
        let mut walker =
            ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        let mut seen = Vec::new();
        for ex in walker.by_ref() {
            let ex = ex.expect("exception");
            seen.push((ex.store, ex.entry, ex.old_chunk.0, ex.offset.0));
        }
        assert_eq!(
            seen,
            vec![
                (0, 0, 10, 128),
                (0, 1, 11, 192),
                (0, 2, 12, 256),
                (0, 3, 13, 320),
                (1, 0, 14, 448),
            ]
        );
        assert_eq!(walker.stores_visited(), 2);
        assert!(walker.is_finished());
    }

    #[test]
    fn empty_chain_yields_nothing() {
        let dev = device_64(4, &[]);
        let walker = ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        assert!(offsets(walker).expect("walk").is_empty());
    }

    #[test]
    fn chain_past_device_end_is_an_error() {
        // Store 0 full, store 1 (chunk 6) would lie past a 6-chunk device.
        let dev = device_64(6, &[(1, &[(1, 2), (2, 3), (3, 4), (4, 5)])]);
        let walker = ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        let results: Vec<_> = walker.collect();
        assert_eq!(results.len(), 5);
        assert!(results[..4].iter().all(Result::is_ok));
        assert!(matches!(results[4], Err(LvsError::MetadataInvalid(_))));
    }

    #[test]
    fn max_stores_bounds_the_walk() {
        let dev = device_64(
            12,
            &[
                (1, &[(1, 2), (2, 3), (3, 4), (4, 5)]),
                (6, &[(5, 7), (0, 0)]),
            ],
        );
        let walker =
            ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), Some(1)).expect("walker");
        let err = offsets(walker).expect_err("limit");
        assert!(matches!(err, LvsError::ChainLimit { stores: 1 }));
    }

    #[test]
    fn pointer_to_metadata_is_rejected() {
        let dev = device_64(8, &[(1, &[(9, 1)])]);
        let walker = ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        assert!(matches!(
            offsets(walker),
            Err(LvsError::MetadataInvalid(_))
        ));
    }

    #[test]
    fn pointer_past_device_end_is_rejected() {
        let dev = device_64(4, &[(1, &[(9, 40)])]);
        let walker = ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        assert!(matches!(
            offsets(walker),
            Err(LvsError::MetadataInvalid(_))
        ));
    }

    #[test]
    fn walker_is_fused_after_error() {
        let dev = device_64(4, &[(1, &[(9, 1)])]);
        let mut walker =
            ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        assert!(walker.next().expect("item").is_err());
        assert!(walker.next().is_none());
        assert!(walker.next().is_none());
    }

    #[test]
    fn zero_chunk_size_is_refused() {
        let dev = device_64(4, &[]);
        let err = ExceptionWalker::new(&dev, ChunkSize::from_sectors(0), None)
            .err()
            .expect("zero chunk size");
        assert!(matches!(err, LvsError::MetadataInvalid(_)));
    }

    #[test]
    fn chunk_size_larger_than_device_is_refused_before_allocating() {
        // (magic, 1, 1, u32::MAX) parses; a ~2 TiB store must never be allocated.
        let dev = MemoryBlockDevice::new(16 * 1024, BlockSize::SECTOR);
        let err = ExceptionWalker::new(&dev, ChunkSize::from_sectors(u32::MAX), None)
            .err()
            .expect("oversized chunk");
        assert!(matches!(err, LvsError::MetadataInvalid(ref msg) if msg.contains("no room")));
        assert_eq!(dev.read_calls(), 0);
    }

    #[test]
    fn first_store_must_fit_exactly() {
        // Header chunk plus one 64-byte store: fits with nothing to spare.
        let dev = device_64(2, &[]);
        assert!(ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).is_ok());
        let dev = device_64(1, &[]);
        assert!(ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).is_err());
    }

    #[test]
    fn misaligned_store_read_reports_store_offset() {
        // 64-byte chunks on a 512-byte-aligned device: store 0 sits at byte 64.
        let dev = MemoryBlockDevice::new(4096, BlockSize::SECTOR);
        let walker = ExceptionWalker::new(&dev, ChunkSize::from_bytes(64), None).expect("walker");
        let err = offsets(walker).expect_err("misaligned");
        match err {
            LvsError::ScrubFailed { offset, source } => {
                assert_eq!(offset, 64);
                assert!(matches!(*source, LvsError::Misaligned { what: "offset", .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
