#![forbid(unsafe_code)]
//! Block-aligned device access.
//!
//! Provides the [`BlockAccessor`] trait and two implementations: a
//! file/block-device backend using `pread`/`pwrite` (optionally with
//! `O_DIRECT`), and an in-memory backend used by tests and dry runs.
//!
//! Alignment is part of the type: offsets are only accepted as
//! [`AlignedOffset`], built against a [`BlockSize`], and buffer lengths must
//! be whole blocks. A misaligned request fails with
//! [`LvsError::Misaligned`] before any syscall is issued.

use lvs_error::{IoOp, LvsError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Device I/O granularity in bytes: a non-zero power of two.
///
/// Direct I/O against real devices needs at least [`BlockSize::SECTOR`];
/// smaller sizes are only meaningful for in-memory devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const SECTOR: Self = Self(512);

    pub fn new(value: u32) -> Result<Self> {
        if !value.is_power_of_two() {
            return Err(LvsError::Precondition(format!(
                "block size {value} is not a non-zero power of two"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn is_aligned(self, value: u64) -> bool {
        value & (self.as_u64() - 1) == 0
    }

    fn check(self, what: &'static str, value: u64) -> Result<()> {
        if self.is_aligned(value) {
            Ok(())
        } else {
            Err(LvsError::Misaligned {
                what,
                value,
                block_size: self.0,
            })
        }
    }
}

/// A byte offset known to be a multiple of the block size it was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlignedOffset {
    offset: u64,
    block_size: BlockSize,
}

impl AlignedOffset {
    pub fn new(offset: u64, block_size: BlockSize) -> Result<Self> {
        block_size.check("offset", offset)?;
        Ok(Self { offset, block_size })
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn block_size(self) -> BlockSize {
        self.block_size
    }
}

/// Block-aligned device for fixed-offset I/O.
///
/// Implementations must reject requests whose offset or length is not a
/// multiple of [`BlockAccessor::block_size`]. Closing happens on drop.
pub trait BlockAccessor: Send + Sync {
    /// Alignment unit for offsets and lengths.
    fn block_size(&self) -> BlockSize;

    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: AlignedOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` starting at `offset`.
    fn write_at(&self, offset: AlignedOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Build an [`AlignedOffset`] for this device.
    fn aligned(&self, offset: u64) -> Result<AlignedOffset> {
        AlignedOffset::new(offset, self.block_size())
    }
}

/// Validate a request against the device's alignment and bounds.
///
/// Returns the end offset of the request.
fn check_request(
    block_size: BlockSize,
    device_len: u64,
    offset: AlignedOffset,
    len: usize,
) -> Result<u64> {
    let len = u64::try_from(len).map_err(|_| LvsError::Misaligned {
        what: "length",
        value: u64::MAX,
        block_size: block_size.get(),
    })?;
    if offset.block_size() != block_size {
        block_size.check("offset", offset.get())?;
    }
    block_size.check("length", len)?;
    let end = offset.get().checked_add(len).ok_or(LvsError::Misaligned {
        what: "offset",
        value: offset.get(),
        block_size: block_size.get(),
    })?;
    if end > device_len {
        return Err(LvsError::io_at(
            IoOp::Seek,
            offset.get(),
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("request of {len} bytes runs past device end {device_len}"),
            ),
        ));
    }
    Ok(end)
}

/// Heap buffer whose start address is aligned for direct I/O.
///
/// Over-allocates by `align` bytes and exposes the aligned window.
#[derive(Debug)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn zeroed(len: usize, align: usize) -> Self {
        let align = align.max(1);
        let storage = vec![0_u8; len + align];
        let start = storage.as_ptr().align_offset(align).min(align);
        Self {
            storage,
            start,
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }
}

/// Options for [`FileBlockDevice::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDeviceOptions {
    pub block_size: BlockSize,
    /// Bypass the page cache (`O_DIRECT`); Linux only.
    pub direct_io: bool,
    pub writable: bool,
}

impl Default for FileDeviceOptions {
    fn default() -> Self {
        Self {
            block_size: BlockSize::SECTOR,
            direct_io: false,
            writable: true,
        }
    }
}

/// File- or block-device-backed accessor using `pread`/`pwrite`.
///
/// With `direct_io`, caller buffers that are not memory-aligned are bounced
/// through an internal [`AlignedBuf`].
#[derive(Debug)]
pub struct FileBlockDevice {
    path: PathBuf,
    file: File,
    len: u64,
    options: FileDeviceOptions,
    bounce: Mutex<AlignedBuf>,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>, options: FileDeviceOptions) -> Result<Self> {
        let path = path.as_ref();
        if options.direct_io && options.block_size < BlockSize::SECTOR {
            return Err(LvsError::Precondition(format!(
                "direct I/O needs a block size of at least {}, got {}",
                BlockSize::SECTOR.get(),
                options.block_size.get()
            )));
        }
        let mut open = OpenOptions::new();
        open.read(true).write(options.writable);
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if options.direct_io {
                open.custom_flags(libc::O_DIRECT);
            }
        }
        let file = open.open(path)?;

        // Block devices report a zero metadata length; seeking to the end works
        // for both block devices and regular files.
        let len = (&file)
            .seek(SeekFrom::End(0))
            .map_err(|err| LvsError::io_at(IoOp::Seek, 0, err))?;
        debug!(
            path = %path.display(),
            len,
            block_size = options.block_size.get(),
            direct_io = options.direct_io,
            writable = options.writable,
            "opened block device"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
            options,
            bounce: Mutex::new(AlignedBuf::zeroed(0, 1)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn needs_bounce(&self, ptr: *const u8) -> bool {
        self.options.direct_io && ptr.align_offset(self.align()) != 0
    }

    fn align(&self) -> usize {
        // Lossless: BlockSize is a u32.
        self.options.block_size.get() as usize
    }

    fn bounce_buffer(&self, len: usize) -> parking_lot::MutexGuard<'_, AlignedBuf> {
        let mut guard = self.bounce.lock();
        if guard.len() != len {
            *guard = AlignedBuf::zeroed(len, self.align());
        }
        guard
    }
}

impl BlockAccessor for FileBlockDevice {
    fn block_size(&self) -> BlockSize {
        self.options.block_size
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: AlignedOffset, buf: &mut [u8]) -> Result<()> {
        check_request(self.options.block_size, self.len, offset, buf.len())?;
        if self.needs_bounce(buf.as_ptr()) {
            let mut bounce = self.bounce_buffer(buf.len());
            self.file
                .read_exact_at(bounce.as_mut_slice(), offset.get())
                .map_err(|err| LvsError::io_at(IoOp::Read, offset.get(), err))?;
            buf.copy_from_slice(bounce.as_slice());
            return Ok(());
        }
        self.file
            .read_exact_at(buf, offset.get())
            .map_err(|err| LvsError::io_at(IoOp::Read, offset.get(), err))
    }

    fn write_at(&self, offset: AlignedOffset, buf: &[u8]) -> Result<()> {
        check_request(self.options.block_size, self.len, offset, buf.len())?;
        if !self.options.writable {
            return Err(LvsError::io_at(
                IoOp::Write,
                offset.get(),
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ));
        }
        if self.needs_bounce(buf.as_ptr()) {
            let mut bounce = self.bounce_buffer(buf.len());
            bounce.as_mut_slice().copy_from_slice(buf);
            return self
                .file
                .write_all_at(bounce.as_slice(), offset.get())
                .map_err(|err| LvsError::io_at(IoOp::Write, offset.get(), err));
        }
        self.file
            .write_all_at(buf, offset.get())
            .map_err(|err| LvsError::io_at(IoOp::Write, offset.get(), err))
    }

    fn sync(&self) -> Result<()> {
        if self.options.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory accessor that counts reads and writes.
///
/// A write failure can be armed at one offset to exercise error paths.
#[derive(Debug)]
pub struct MemoryBlockDevice {
    bytes: Mutex<Vec<u8>>,
    block_size: BlockSize,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_write_at: Mutex<Option<u64>>,
}

impl MemoryBlockDevice {
    #[must_use]
    pub fn new(len: usize, block_size: BlockSize) -> Self {
        Self::from_bytes(vec![0_u8; len], block_size)
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>, block_size: BlockSize) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            block_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_write_at: Mutex::new(None),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    #[must_use]
    pub fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make the next write starting at `offset` fail with `EIO`.
    pub fn fail_write_at(&self, offset: u64) {
        *self.fail_write_at.lock() = Some(offset);
    }

    fn range(&self, offset: AlignedOffset, len: usize) -> Result<std::ops::Range<usize>> {
        let device_len = u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX);
        let end = check_request(self.block_size, device_len, offset, len)?;
        let start = usize::try_from(offset.get()).map_err(|_| LvsError::Misaligned {
            what: "offset",
            value: offset.get(),
            block_size: self.block_size.get(),
        })?;
        let end = usize::try_from(end).map_err(|_| LvsError::Misaligned {
            what: "offset",
            value: end,
            block_size: self.block_size.get(),
        })?;
        Ok(start..end)
    }
}

impl BlockAccessor for MemoryBlockDevice {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_at(&self, offset: AlignedOffset, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        buf.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    fn write_at(&self, offset: AlignedOffset, buf: &[u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        {
            let mut armed = self.fail_write_at.lock();
            if *armed == Some(offset.get()) {
                *armed = None;
                return Err(LvsError::io_at(
                    IoOp::Write,
                    offset.get(),
                    std::io::Error::from_raw_os_error(libc::EIO),
                ));
            }
        }
        self.bytes.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
