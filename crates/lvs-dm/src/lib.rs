#![forbid(unsafe_code)]
//! Device-mapper plumbing for scrubbing a live snapshot.
//!
//! Everything here talks to the kernel through `dmsetup` and `lvremove`
//! via a [`CommandRunner`], so the protocol can be driven against a
//! recording runner in tests.

pub mod names;
pub mod protocol;
pub mod runner;
pub mod table;

pub use names::{DM_DIR, SnapshotNames};
pub use protocol::{DetachProtocol, DmConfig, ProtocolState, SuspendGuard};
pub use runner::{CommandOutput, CommandRunner, Invocation, SystemCommandRunner, ensure_privileged};
pub use table::{DmSegment, DmTable};
