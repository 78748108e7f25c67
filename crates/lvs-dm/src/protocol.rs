//! Detach a snapshot's COW device from live traffic, scrub it through a
//! private alias, then remove the snapshot.
//!
//! ```text
//! Idle ─create─▶ ZeroDeviceCreated ─suspend─▶ CowSuspended ─load─▶ CowErrorTableLoaded
//!                                                                         │ resume
//! SnapshotRemoved ◀─remove── Scrubbed ◀─scrub── CowResumed ◀──────────────┘
//! ```
//!
//! A failure before the resume removes the `<cow>-zero` alias and returns
//! the protocol to `Idle`. Once a suspend has been attempted the COW device
//! is resumed on every exit path; a failed resume is reported as
//! [`LvsError::ResumeFailed`].

use crate::names::SnapshotNames;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::table::DmTable;
use lvs_error::{LvsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, error, info, warn};

// ── Configuration ───────────────────────────────────────────────────────────

/// External programs and removal policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    pub dmsetup: String,
    pub lvremove: String,
    /// Leave the zero alias and the snapshot in place after scrubbing.
    pub skip_remove: bool,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            dmsetup: "dmsetup".to_owned(),
            lvremove: "lvremove".to_owned(),
            skip_remove: false,
        }
    }
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Idle,
    ZeroDeviceCreated,
    CowSuspended,
    CowErrorTableLoaded,
    CowResumed,
    Scrubbed,
    SnapshotRemoved,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ZeroDeviceCreated => "zero_device_created",
            Self::CowSuspended => "cow_suspended",
            Self::CowErrorTableLoaded => "cow_error_table_loaded",
            Self::CowResumed => "cow_resumed",
            Self::Scrubbed => "scrubbed",
            Self::SnapshotRemoved => "snapshot_removed",
        };
        f.write_str(name)
    }
}

/// Current state plus every state entered, in order.
#[derive(Debug)]
struct Tracker {
    state: ProtocolState,
    history: Vec<ProtocolState>,
}

impl Tracker {
    fn advance(&mut self, next: ProtocolState) {
        debug!(from = %self.state, to = %next, "protocol transition");
        self.state = next;
        self.history.push(next);
    }
}

// ── Suspend guard ───────────────────────────────────────────────────────────

/// Scoped suspension of one device.
///
/// Armed as soon as a suspend is attempted; a failed suspend may still have
/// left the device suspended. [`SuspendGuard::resume`] consumes the guard and
/// reports the outcome. Dropping an armed guard resumes on a best-effort basis
/// and can only log a failure.
pub struct SuspendGuard<'a, R: CommandRunner + ?Sized> {
    runner: &'a mut R,
    dmsetup: &'a str,
    device: &'a str,
    armed: bool,
}

impl<'a, R: CommandRunner + ?Sized> SuspendGuard<'a, R> {
    pub fn new(runner: &'a mut R, dmsetup: &'a str, device: &'a str) -> Self {
        Self {
            runner,
            dmsetup,
            device,
            armed: false,
        }
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.armed = true;
        self.runner
            .run(&Invocation::new(self.dmsetup).arg("suspend").arg(self.device))
            .map(drop)
    }

    /// Load `table` into the suspended device's inactive slot.
    pub fn load(&mut self, table: &DmTable) -> Result<()> {
        self.runner
            .run(
                &Invocation::new(self.dmsetup)
                    .arg("load")
                    .arg(self.device)
                    .stdin(table.render()),
            )
            .map(drop)
    }

    /// Runner access for commands that must happen while suspended.
    pub fn runner(&mut self) -> &mut R {
        self.runner
    }

    pub fn resume(mut self) -> Result<()> {
        self.armed = false;
        self.resume_device()
    }

    fn resume_device(&mut self) -> Result<()> {
        self.runner
            .run(&Invocation::new(self.dmsetup).arg("resume").arg(self.device))
            .map(drop)
    }
}

impl<R: CommandRunner + ?Sized> Drop for SuspendGuard<'_, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(err) = self.resume_device() {
            error!(device = self.device, error = %err, "resume on unwind failed; device left suspended");
        }
    }
}

// ── Protocol ────────────────────────────────────────────────────────────────

pub struct DetachProtocol<'r, R: CommandRunner + ?Sized> {
    runner: &'r mut R,
    names: SnapshotNames,
    config: DmConfig,
    tracker: Tracker,
}

impl<'r, R: CommandRunner + ?Sized> DetachProtocol<'r, R> {
    pub fn new(runner: &'r mut R, names: SnapshotNames, config: DmConfig) -> Self {
        Self {
            runner,
            names,
            config,
            tracker: Tracker {
                state: ProtocolState::Idle,
                history: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.tracker.state
    }

    /// States entered so far, excluding the initial `Idle`.
    #[must_use]
    pub fn history(&self) -> &[ProtocolState] {
        &self.tracker.history
    }

    #[must_use]
    pub fn names(&self) -> &SnapshotNames {
        &self.names
    }

    /// Detach, scrub through the zero alias, then tear down.
    pub fn run<T>(&mut self, scrub: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        self.detach()?;
        let out = self.scrub_with(scrub)?;
        self.teardown()?;
        Ok(out)
    }

    /// Create the zero alias and swap the COW device onto an error table.
    pub fn detach(&mut self) -> Result<()> {
        self.require(ProtocolState::Idle, "detach")?;

        let dmsetup = self.config.dmsetup.clone();
        let cow = self.names.cow.clone();
        let zero = self.names.zero.clone();

        let table = match self.prepare_zero_device(&cow) {
            Ok(table) => table,
            Err(err) => {
                self.rollback(&err);
                return Err(err);
            }
        };
        let sectors = table.total_sectors();
        self.tracker.advance(ProtocolState::ZeroDeviceCreated);

        let mut guard = SuspendGuard::new(&mut *self.runner, &dmsetup, &cow);

        let swapped = match guard.suspend() {
            Ok(()) => {
                self.tracker.advance(ProtocolState::CowSuspended);
                guard.load(&DmTable::error_table(sectors))
            }
            Err(err) => Err(err),
        };
        match &swapped {
            Ok(()) => self.tracker.advance(ProtocolState::CowErrorTableLoaded),
            Err(err) => {
                warn!(device = %cow, error = %err, "table swap failed; removing zero device");
                let remove = Invocation::new(&dmsetup).arg("remove").arg(&zero);
                if let Err(remove_err) = guard.runner().run(&remove) {
                    warn!(device = %zero, error = %remove_err, "rollback removal failed");
                }
            }
        }

        let resumed = guard.resume();
        match (swapped, resumed) {
            (Ok(()), Ok(())) => {
                self.tracker.advance(ProtocolState::CowResumed);
                info!(cow = %cow, zero = %zero, "COW device detached");
                Ok(())
            }
            (Err(err), Ok(())) => {
                self.tracker.advance(ProtocolState::Idle);
                Err(err)
            }
            (swapped, Err(resume_err)) => {
                if let Err(err) = swapped {
                    error!(device = %cow, error = %err, "table swap failed before resume");
                }
                Err(LvsError::ResumeFailed {
                    device: cow,
                    source: Box::new(resume_err),
                })
            }
        }
    }

    /// Run `scrub` against the zero alias node.
    ///
    /// A scrub failure leaves the alias and the error-mapped COW device in
    /// place; chunks already zeroed stay zeroed.
    pub fn scrub_with<T>(&mut self, scrub: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        self.require(ProtocolState::CowResumed, "scrub")?;
        let zero_path = self.names.zero_path();
        match scrub(&zero_path) {
            Ok(out) => {
                self.tracker.advance(ProtocolState::Scrubbed);
                Ok(out)
            }
            Err(err) => {
                warn!(zero = %zero_path.display(), "scrub failed; zero device left in place");
                Err(err)
            }
        }
    }

    /// Remove the zero alias and the snapshot, unless `skip_remove` is set.
    pub fn teardown(&mut self) -> Result<()> {
        self.require(ProtocolState::Scrubbed, "teardown")?;
        if self.config.skip_remove {
            info!(
                snapshot = %self.names.snapshot.display(),
                zero = %self.names.zero,
                "skip remove: leaving snapshot and zero device"
            );
            return Ok(());
        }

        let zero = self.names.zero.clone();
        self.dmsetup_output(&["remove", &zero])?;
        let lvremove = Invocation::new(&self.config.lvremove)
            .arg("-f")
            .arg(self.names.snapshot.to_string_lossy());
        self.runner.run(&lvremove)?;
        self.tracker.advance(ProtocolState::SnapshotRemoved);
        info!(snapshot = %self.names.snapshot.display(), "snapshot removed");
        Ok(())
    }

    /// Read the COW table and make sure the zero alias maps the same blocks.
    fn prepare_zero_device(&mut self, cow: &str) -> Result<DmTable> {
        let output = self.dmsetup_output(&["table", cow])?;
        let table = DmTable::parse(&output.stdout)?;
        self.create_zero_device(&table)?;
        Ok(table)
    }

    fn create_zero_device(&mut self, table: &DmTable) -> Result<()> {
        let zero = self.names.zero.clone();
        if self.device_exists(&zero)? {
            info!(device = %zero, "zero device already exists; reusing");
            return Ok(());
        }
        let create = Invocation::new(&self.config.dmsetup)
            .arg("create")
            .arg(&zero)
            .stdin(table.render());
        self.runner.run(&create).map(drop)
    }

    /// `dmsetup info` exits non-zero for an unknown device.
    fn device_exists(&mut self, name: &str) -> Result<bool> {
        match self.dmsetup_output(&["info", name]) {
            Ok(_) => Ok(true),
            Err(LvsError::Command { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn rollback(&mut self, cause: &LvsError) {
        warn!(error = %cause, device = %self.names.zero, "zero device setup failed; rolling back");
        let zero = self.names.zero.clone();
        if let Err(err) = self.dmsetup_output(&["remove", &zero]) {
            warn!(device = %zero, error = %err, "rollback removal failed");
        }
        self.tracker.state = ProtocolState::Idle;
    }

    fn dmsetup_output(&mut self, args: &[&str]) -> Result<CommandOutput> {
        let invocation = args
            .iter()
            .fold(Invocation::new(&self.config.dmsetup), |inv, arg| inv.arg(*arg));
        self.runner.run(&invocation)
    }

    fn require(&self, expected: ProtocolState, step: &str) -> Result<()> {
        if self.tracker.state == expected {
            Ok(())
        } else {
            Err(LvsError::Precondition(format!(
                "{step} requires protocol state {expected}, current state is {}",
                self.tracker.state
            )))
        }
    }
}
