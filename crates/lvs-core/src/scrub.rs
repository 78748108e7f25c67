//! Scrub engine: zero-fills every live exception chunk.
//!
//! The engine drives an [`ExceptionWalker`] and, for each yielded exception,
//! writes one chunk of zeroes at its data offset (or, in display-only mode,
//! only counts it). It never writes to the header or to exception stores:
//! the walker refuses pointers into metadata before they reach the engine.
//!
//! The count comes from metadata, not data, so re-running against an
//! already-scrubbed device reports the same count and leaves the same bytes.
//!
//! Any Block Accessor failure aborts the walk and is returned as
//! [`LvsError::ScrubFailed`] with the offset it happened at. Chunks zeroed
//! before the failure stay zeroed.

use crate::config::{Detail, ScrubConfig, ScrubMode};
use crate::walker::{CowException, ExceptionWalker};
use lvs_block::{AlignedBuf, BlockAccessor};
use lvs_error::{LvsError, Result};
use lvs_ondisk::CowHeader;
use lvs_types::ChunkSize;
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use tracing::{info, warn};

// ── Summary ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrubSummary {
    pub mode: ScrubMode,
    pub chunk_size: u64,
    /// Live exceptions found, whether or not they were written.
    pub exceptions: u64,
    pub bytes_zeroed: u64,
    pub stores_visited: u64,
}

impl fmt::Display for ScrubSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exceptions across {} stores (chunk size {}), {} bytes zeroed",
            self.exceptions, self.stores_visited, self.chunk_size, self.bytes_zeroed
        )
    }
}

// ── Reporters ───────────────────────────────────────────────────────────────

/// Receives per-exception events from the engine.
///
/// `prior` is the chunk's contents before scrubbing; it is only read when
/// the engine runs with [`Detail::Contents`].
pub trait ScrubReporter {
    fn header(&mut self, _header: &CowHeader) {}

    fn exception(&mut self, exception: &CowException, prior: Option<&[u8]>);

    fn finished(&mut self, _summary: &ScrubSummary) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ScrubReporter for NullReporter {
    fn exception(&mut self, _exception: &CowException, _prior: Option<&[u8]>) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingReporter {
    detail: Detail,
}

impl TracingReporter {
    #[must_use]
    pub fn new(detail: Detail) -> Self {
        Self { detail }
    }
}

impl ScrubReporter for TracingReporter {
    fn header(&mut self, header: &CowHeader) {
        info!(
            magic = format_args!("{:#X}", header.magic),
            valid = header.valid,
            version = header.version,
            chunk_size = header.chunk_size().bytes(),
            "COW header"
        );
    }

    fn exception(&mut self, exception: &CowException, prior: Option<&[u8]>) {
        if self.detail == Detail::Quiet {
            return;
        }
        info!(
            store = exception.store,
            entry = exception.entry,
            old_chunk = exception.old_chunk.0,
            new_chunk = exception.new_chunk.0,
            offset = exception.offset.0,
            "exception"
        );
        if let Some(bytes) = prior {
            for line in hex_dump(exception.offset.0, bytes).lines() {
                info!("{line}");
            }
        }
    }

    fn finished(&mut self, summary: &ScrubSummary) {
        info!(%summary, "scrub finished");
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    pub header: Option<CowHeader>,
    pub exceptions: Vec<CowException>,
    pub contents: Vec<Vec<u8>>,
    pub summary: Option<ScrubSummary>,
}

impl ScrubReporter for CollectingReporter {
    fn header(&mut self, header: &CowHeader) {
        self.header = Some(*header);
    }

    fn exception(&mut self, exception: &CowException, prior: Option<&[u8]>) {
        self.exceptions.push(*exception);
        if let Some(bytes) = prior {
            self.contents.push(bytes.to_vec());
        }
    }

    fn finished(&mut self, summary: &ScrubSummary) {
        self.summary = Some(*summary);
    }
}

/// Classic 16-bytes-per-line dump, labelled with absolute device offsets.
#[must_use]
pub fn hex_dump(base: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut line_start = base;
    for line in bytes.chunks(16) {
        let _ = write!(out, "{line_start:012x} ");
        for byte in line {
            let _ = write!(out, " {byte:02x}");
        }
        for _ in line.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  |");
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                char::from(b)
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
        line_start += 16;
    }
    out
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Zero-fill engine over one COW device.
pub struct Scrubber<'a> {
    device: &'a dyn BlockAccessor,
    chunk_size: ChunkSize,
    mode: ScrubMode,
    detail: Detail,
    max_stores: Option<u64>,
    sync_after: bool,
}

impl<'a> Scrubber<'a> {
    #[must_use]
    pub fn new(device: &'a dyn BlockAccessor, chunk_size: ChunkSize) -> Self {
        Self {
            device,
            chunk_size,
            mode: ScrubMode::Zero,
            detail: Detail::Quiet,
            max_stores: None,
            sync_after: false,
        }
    }

    /// Apply mode, detail, store limit, and sync policy from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &ScrubConfig) -> Self {
        self.mode = config.mode;
        self.detail = config.effective_detail();
        self.max_stores = config.max_stores;
        self.sync_after = config.sync_after_scrub;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: ScrubMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: Detail) -> Self {
        self.detail = detail;
        self
    }

    /// Walk the exception chain and scrub (or count) every live exception.
    pub fn run(&self, reporter: &mut dyn ScrubReporter) -> Result<ScrubSummary> {
        let mut walker = ExceptionWalker::new(self.device, self.chunk_size, self.max_stores)?;
        let chunk_len = self
            .chunk_size
            .to_usize()
            .map_err(crate::metadata_error)?;
        // The walker has already checked that a chunk fits on the device.
        let align = usize::try_from(self.device.block_size().get()).unwrap_or(1);
        let zeroes = AlignedBuf::zeroed(chunk_len, align);
        let mut prior = (self.detail == Detail::Contents).then(|| vec![0_u8; chunk_len]);

        let mut exceptions: u64 = 0;
        let mut bytes_zeroed: u64 = 0;

        for item in walker.by_ref() {
            let exception = item?;
            let offset = exception.offset.0;

            if let Some(buf) = prior.as_mut() {
                self.device
                    .aligned(offset)
                    .and_then(|at| self.device.read_at(at, buf))
                    .map_err(|source| scrub_failed(offset, source))?;
            }

            if self.mode == ScrubMode::Zero {
                self.device
                    .aligned(offset)
                    .and_then(|at| self.device.write_at(at, zeroes.as_slice()))
                    .map_err(|source| {
                        warn!(offset, scrubbed = exceptions, "zero-fill failed, aborting walk");
                        scrub_failed(offset, source)
                    })?;
                bytes_zeroed += self.chunk_size.bytes();
            }

            exceptions += 1;
            reporter.exception(&exception, prior.as_deref());
        }

        if self.mode == ScrubMode::Zero && self.sync_after && exceptions > 0 {
            self.device.sync()?;
        }

        let summary = ScrubSummary {
            mode: self.mode,
            chunk_size: self.chunk_size.bytes(),
            exceptions,
            bytes_zeroed,
            stores_visited: walker.stores_visited(),
        };
        reporter.finished(&summary);
        Ok(summary)
    }
}

fn scrub_failed(offset: u64, source: LvsError) -> LvsError {
    LvsError::ScrubFailed {
        offset,
        source: Box::new(source),
    }
}
