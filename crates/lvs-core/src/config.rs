//! Scrub configuration.

use lvs_block::{BlockSize, FileDeviceOptions};
use lvs_error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the engine does with each live exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubMode {
    /// Overwrite each exception chunk with zeroes.
    #[default]
    Zero,
    /// Count and report only; never write.
    DisplayOnly,
}

impl fmt::Display for ScrubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "zero"),
            Self::DisplayOnly => write!(f, "display_only"),
        }
    }
}

/// How much the reporter is told about each exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    /// Nothing beyond the final count.
    #[default]
    Quiet,
    /// Location of each exception.
    Plain,
    /// Location plus the chunk's contents before scrubbing.
    Contents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    pub mode: ScrubMode,
    pub detail: Detail,
    /// Alignment for every device request, in bytes.
    pub block_size: u32,
    pub direct_io: bool,
    /// Stop with an error after this many stores without a terminator.
    pub max_stores: Option<u64>,
    pub sync_after_scrub: bool,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            mode: ScrubMode::Zero,
            detail: Detail::Quiet,
            block_size: BlockSize::SECTOR.get(),
            direct_io: true,
            max_stores: None,
            sync_after_scrub: true,
        }
    }
}

impl ScrubConfig {
    /// Display-only runs always report each exception.
    #[must_use]
    pub fn effective_detail(&self) -> Detail {
        match self.mode {
            ScrubMode::DisplayOnly => self.detail.max(Detail::Plain),
            ScrubMode::Zero => self.detail,
        }
    }

    pub fn device_options(&self) -> Result<FileDeviceOptions> {
        Ok(FileDeviceOptions {
            block_size: BlockSize::new(self.block_size)?,
            direct_io: self.direct_io,
            writable: self.mode == ScrubMode::Zero,
        })
    }
}
