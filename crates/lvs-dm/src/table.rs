//! Device-mapper table text as printed by `dmsetup table`.

use lvs_error::{LvsError, Result};
use std::fmt;

/// One `start length target [params]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmSegment {
    pub start: u64,
    pub length: u64,
    pub target: String,
    pub params: String,
}

impl fmt::Display for DmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.start, self.length, self.target)?;
        if !self.params.is_empty() {
            write!(f, " {}", self.params)?;
        }
        Ok(())
    }
}

/// A whole device table. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTable {
    segments: Vec<DmSegment>,
}

impl DmTable {
    /// Parse `dmsetup table` output. Blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            segments.push(parse_segment(line).ok_or_else(|| {
                LvsError::Precondition(format!(
                    "unparseable device-mapper table line {}: {line:?}",
                    lineno + 1
                ))
            })?);
        }
        if segments.is_empty() {
            return Err(LvsError::Precondition(
                "device-mapper table is empty".to_owned(),
            ));
        }
        Ok(Self { segments })
    }

    /// Single-segment table mapping `sectors` sectors to the `error` target.
    #[must_use]
    pub fn error_table(sectors: u64) -> Self {
        Self {
            segments: vec![DmSegment {
                start: 0,
                length: sectors,
                target: "error".to_owned(),
                params: String::new(),
            }],
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[DmSegment] {
        &self.segments
    }

    /// Device size in sectors: the furthest segment end.
    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.start.saturating_add(s.length))
            .max()
            .unwrap_or(0)
    }

    /// Table text suitable for `dmsetup create`/`load` stdin.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            out.push_str(&seg.to_string());
            out.push('\n');
        }
        out
    }
}

fn parse_segment(line: &str) -> Option<DmSegment> {
    let mut fields = line.split_whitespace();
    let start = fields.next()?.parse().ok()?;
    let length = fields.next()?.parse().ok()?;
    let target = fields.next()?.to_owned();
    let params = fields.collect::<Vec<_>>().join(" ");
    Some(DmSegment {
        start,
        length,
        target,
        params,
    })
}
