#![forbid(unsafe_code)]
//! COW snapshot scrubbing: header read, exception walk, zero-fill.
//!
//! Ties the pure parsers in `lvs-ondisk` to a [`BlockAccessor`]. The header
//! is always read and validated before any exception store is touched; a
//! header failure returns [`LvsError::MetadataInvalid`] with nothing written.

pub mod config;
pub mod scrub;
pub mod walker;

pub use config::{Detail, ScrubConfig, ScrubMode};
pub use scrub::{
    CollectingReporter, NullReporter, ScrubReporter, ScrubSummary, Scrubber, TracingReporter,
    hex_dump,
};
pub use walker::{CowException, ExceptionWalker};

use lvs_block::{BlockAccessor, FileBlockDevice};
use lvs_error::{LvsError, Result};
use lvs_ondisk::CowHeader;
use lvs_types::{COW_HEADER_SIZE, ParseError, align_up, u64_to_usize};
use std::path::Path;
use tracing::info;

/// Convert a parse-layer failure into the reported error.
///
/// Every COW parse failure means the device is not usable COW metadata.
#[must_use]
pub fn metadata_error(err: ParseError) -> LvsError {
    LvsError::MetadataInvalid(err.to_string())
}

/// Read and validate the COW header at offset 0.
pub fn read_header(device: &dyn BlockAccessor) -> Result<CowHeader> {
    let block = device.block_size().as_u64();
    let len = align_up(COW_HEADER_SIZE as u64, block)
        .ok_or_else(|| LvsError::MetadataInvalid("header read length overflows".to_owned()))?;
    let mut buf = vec![0_u8; u64_to_usize(len, "header_len").map_err(metadata_error)?];
    device.read_at(device.aligned(0)?, &mut buf)?;
    CowHeader::parse(&buf).map_err(metadata_error)
}

/// Scrub an open COW device according to `config`.
pub fn scrub_device(
    device: &dyn BlockAccessor,
    config: &ScrubConfig,
    reporter: &mut dyn ScrubReporter,
) -> Result<ScrubSummary> {
    let header = read_header(device)?;
    reporter.header(&header);
    info!(
        chunk_size = header.chunk_size().bytes(),
        mode = %config.mode,
        "scrubbing COW exceptions"
    );
    Scrubber::new(device, header.chunk_size())
        .with_config(config)
        .run(reporter)
}

/// Open the device at `path` and scrub it.
///
/// Display-only runs open the device read-only.
pub fn scrub_path(
    path: &Path,
    config: &ScrubConfig,
    reporter: &mut dyn ScrubReporter,
) -> Result<ScrubSummary> {
    let device = FileBlockDevice::open(path, config.device_options()?)?;
    scrub_device(&device, config, reporter)
}
