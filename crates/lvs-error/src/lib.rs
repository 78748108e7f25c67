#![forbid(unsafe_code)]
//! Error types for lvscrub.
//!
//! # Error Taxonomy
//!
//! lvscrub uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lvs-types` | COW header / exception record violations found while decoding bytes |
//! | Runtime | `LvsError` | `lvs-error` (this crate) | Everything reported to the CLI and API consumers |
//!
//! `lvs-error` does not depend on `lvs-types`. `lvs-core` owns the
//! `ParseError` → `LvsError::MetadataInvalid` conversion.
//!
//! ## Kinds
//!
//! Every variant is classified into exactly one [`ErrorKind`] by
//! [`LvsError::kind`]. The match is exhaustive, so a new variant does not
//! compile until it is classified.
//!
//! | Variant | Kind |
//! |---------|------|
//! | `MetadataInvalid`, `ChainLimit` | `MetadataInvalid` |
//! | `Io`, `IoAt`, `Misaligned`, `ScrubFailed` | `IoFailure` |
//! | `Command`, `CommandSpawn`, `PermissionDenied` | `CommandFailure` |
//! | `Precondition` | `PreconditionFailure` |
//! | `ResumeFailed` | `Fatal` |
//!
//! Nothing in lvscrub retries. `ResumeFailed` is kept apart from ordinary
//! command failures because it leaves the COW device suspended.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Unified error type for all lvscrub operations.
#[derive(Debug, Error)]
pub enum LvsError {
    /// Operating system I/O error with no useful offset (open, stat, sync).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Seek/read/write failure at a known device offset.
    #[error("{op} failed at offset {offset}: {source}")]
    IoAt {
        op: IoOp,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// A Block Accessor request violated the device's alignment contract.
    #[error("{what} {value} is not a multiple of block size {block_size}")]
    Misaligned {
        what: &'static str,
        value: u64,
        block_size: u32,
    },

    /// The COW header or exception chain is not usable.
    #[error("invalid COW metadata: {0}")]
    MetadataInvalid(String),

    /// The exception chain exceeded the configured store limit without a terminator.
    #[error("exception chain exceeded {stores} stores without a terminator")]
    ChainLimit { stores: u64 },

    /// Zeroing an exception chunk failed; already-scrubbed chunks stay zeroed.
    #[error("scrub failed at offset {offset}: {source}")]
    ScrubFailed {
        offset: u64,
        #[source]
        source: Box<LvsError>,
    },

    /// External command ran and exited unsuccessfully.
    #[error("command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// External command could not be started at all.
    #[error("could not run `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Volume-management operations need privileges the process lacks.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An input precondition does not hold (e.g. the snapshot path is missing).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Resuming the suspended COW device failed; the device is left suspended.
    #[error("FATAL: could not resume {device}; device left suspended: {source}")]
    ResumeFailed {
        device: String,
        #[source]
        source: Box<LvsError>,
    },
}

/// Block Accessor operation named in [`LvsError::IoAt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOp {
    Seek,
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seek => write!(f, "seek"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Reported error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MetadataInvalid,
    IoFailure,
    CommandFailure,
    PreconditionFailure,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetadataInvalid => write!(f, "metadata_invalid"),
            Self::IoFailure => write!(f, "io_failure"),
            Self::CommandFailure => write!(f, "command_failure"),
            Self::PreconditionFailure => write!(f, "precondition_failure"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

impl LvsError {
    /// Classify this error.
    ///
    /// `ScrubFailed` is always an I/O failure, whatever it wraps; the wrapped
    /// cause is still reachable through `source()`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MetadataInvalid(_) | Self::ChainLimit { .. } => ErrorKind::MetadataInvalid,
            Self::Io(_) | Self::IoAt { .. } | Self::Misaligned { .. } | Self::ScrubFailed { .. } => {
                ErrorKind::IoFailure
            }
            Self::Command { .. } | Self::CommandSpawn { .. } | Self::PermissionDenied(_) => {
                ErrorKind::CommandFailure
            }
            Self::Precondition(_) => ErrorKind::PreconditionFailure,
            Self::ResumeFailed { .. } => ErrorKind::Fatal,
        }
    }

    /// Wrap an I/O error with the operation and offset it happened at.
    #[must_use]
    pub fn io_at(op: IoOp, offset: u64, source: std::io::Error) -> Self {
        Self::IoAt { op, offset, source }
    }
}

/// Result alias using `LvsError`.
pub type Result<T> = std::result::Result<T, LvsError>;
