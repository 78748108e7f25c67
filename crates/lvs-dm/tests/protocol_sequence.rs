#![forbid(unsafe_code)]

use lvs_block::{BlockSize, MemoryBlockDevice};
use lvs_core::{NullReporter, ScrubConfig, ScrubMode, scrub_device};
use lvs_dm::{
    CommandOutput, CommandRunner, DetachProtocol, DmConfig, Invocation, ProtocolState,
    SnapshotNames,
};
use lvs_error::{ErrorKind, LvsError, Result};
use lvs_ondisk::{CowHeader, DiskException};
use lvs_types::COW_DISK_MAGIC;
use std::path::{Path, PathBuf};

const COW_TABLE: &str = "0 409600 linear 253:3 0\n";

/// Records every invocation and fails the first one whose rendered command
/// line equals a configured string.
#[derive(Default)]
struct RecordingRunner {
    calls: Vec<Invocation>,
    fail: Vec<String>,
    existing_zero: bool,
}

impl RecordingRunner {
    fn failing(commands: &[&str]) -> Self {
        Self {
            fail: commands.iter().map(|c| (*c).to_owned()).collect(),
            ..Self::default()
        }
    }

    fn lines(&self) -> Vec<String> {
        self.calls.iter().map(ToString::to_string).collect()
    }

    fn count(&self, line: &str) -> usize {
        self.lines().iter().filter(|l| l.as_str() == line).count()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.push(invocation.clone());
        let line = invocation.to_string();
        let status_fail = |stderr: &str| LvsError::Command {
            command: line.clone(),
            status: "exit status: 1".to_owned(),
            stderr: stderr.to_owned(),
        };
        if let Some(pos) = self.fail.iter().position(|f| *f == line) {
            self.fail.remove(pos);
            return Err(status_fail("injected failure"));
        }
        match invocation.args.first().map(String::as_str) {
            Some("table") => Ok(CommandOutput {
                stdout: COW_TABLE.to_owned(),
                stderr: String::new(),
            }),
            Some("info") if !self.existing_zero => Err(status_fail("Device does not exist.")),
            _ => Ok(CommandOutput::default()),
        }
    }
}

fn names() -> SnapshotNames {
    SnapshotNames::from_path(Path::new("/dev/vg0/snap")).expect("names")
}

#[test]
fn full_run_issues_commands_in_order() {
    let mut runner = RecordingRunner::default();
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let seen = proto
        .run(|path| Ok(path.to_path_buf()))
        .expect("protocol run");
    assert_eq!(seen, PathBuf::from("/dev/mapper/vg0-snap-cow-zero"));
    assert_eq!(proto.state(), ProtocolState::SnapshotRemoved);
    assert_eq!(
        proto.history(),
        &[
            ProtocolState::ZeroDeviceCreated,
            ProtocolState::CowSuspended,
            ProtocolState::CowErrorTableLoaded,
            ProtocolState::CowResumed,
            ProtocolState::Scrubbed,
            ProtocolState::SnapshotRemoved,
        ]
    );

    assert_eq!(
        runner.lines(),
        vec![
            "dmsetup table vg0-snap-cow",
            "dmsetup info vg0-snap-cow-zero",
            "dmsetup create vg0-snap-cow-zero",
            "dmsetup suspend vg0-snap-cow",
            "dmsetup load vg0-snap-cow",
            "dmsetup resume vg0-snap-cow",
            "dmsetup remove vg0-snap-cow-zero",
            "lvremove -f /dev/vg0/snap",
        ]
    );
    assert_eq!(runner.calls[2].stdin.as_deref(), Some(COW_TABLE));
    assert_eq!(runner.calls[4].stdin.as_deref(), Some("0 409600 error\n"));
}

#[test]
fn failed_error_table_load_removes_zero_and_resumes_once() {
    let mut runner = RecordingRunner::failing(&["dmsetup load vg0-snap-cow"]);
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let mut scrubbed = false;
    let err = proto
        .run(|_| {
            scrubbed = true;
            Ok(())
        })
        .expect_err("load fails");
    assert_eq!(err.kind(), ErrorKind::CommandFailure);
    assert!(!scrubbed, "scrub must not run after a failed detach");
    assert_eq!(proto.state(), ProtocolState::Idle);

    assert_eq!(
        runner.lines(),
        vec![
            "dmsetup table vg0-snap-cow",
            "dmsetup info vg0-snap-cow-zero",
            "dmsetup create vg0-snap-cow-zero",
            "dmsetup suspend vg0-snap-cow",
            "dmsetup load vg0-snap-cow",
            "dmsetup remove vg0-snap-cow-zero",
            "dmsetup resume vg0-snap-cow",
        ]
    );
    assert_eq!(runner.count("dmsetup resume vg0-snap-cow"), 1);
}

#[test]
fn failed_suspend_still_resumes() {
    let mut runner = RecordingRunner::failing(&["dmsetup suspend vg0-snap-cow"]);
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    proto.detach().expect_err("suspend fails");
    assert_eq!(runner.count("dmsetup resume vg0-snap-cow"), 1);
    assert_eq!(runner.count("dmsetup remove vg0-snap-cow-zero"), 1);
    assert_eq!(runner.count("dmsetup load vg0-snap-cow"), 0);
}

#[test]
fn failed_create_rolls_back_without_suspending() {
    let mut runner = RecordingRunner::failing(&["dmsetup create vg0-snap-cow-zero"]);
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    proto.detach().expect_err("create fails");
    assert_eq!(proto.state(), ProtocolState::Idle);
    assert_eq!(runner.count("dmsetup remove vg0-snap-cow-zero"), 1);
    assert_eq!(runner.count("dmsetup suspend vg0-snap-cow"), 0);
    assert_eq!(runner.count("dmsetup resume vg0-snap-cow"), 0);
}

#[test]
fn failed_table_read_removes_leftover_zero_device() {
    let mut runner = RecordingRunner::failing(&["dmsetup table vg0-snap-cow"]);
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let err = proto.detach().expect_err("table read fails");
    assert_eq!(err.kind(), ErrorKind::CommandFailure);
    assert_eq!(proto.state(), ProtocolState::Idle);
    assert_eq!(
        runner.lines(),
        vec![
            "dmsetup table vg0-snap-cow",
            "dmsetup remove vg0-snap-cow-zero",
        ]
    );
    assert_eq!(runner.count("dmsetup suspend vg0-snap-cow"), 0);
    assert_eq!(runner.count("dmsetup resume vg0-snap-cow"), 0);
}

#[test]
fn resume_failure_is_fatal() {
    let mut runner = RecordingRunner::failing(&["dmsetup resume vg0-snap-cow"]);
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let err = proto.detach().expect_err("resume fails");
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().starts_with("FATAL: could not resume vg0-snap-cow"));
    assert_eq!(proto.state(), ProtocolState::CowErrorTableLoaded);
    assert_eq!(runner.count("dmsetup resume vg0-snap-cow"), 1);
}

#[test]
fn existing_zero_device_is_reused() {
    let mut runner = RecordingRunner {
        existing_zero: true,
        ..RecordingRunner::default()
    };
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    proto.detach().expect("detach");
    assert_eq!(runner.count("dmsetup create vg0-snap-cow-zero"), 0);
    assert_eq!(runner.count("dmsetup suspend vg0-snap-cow"), 1);
}

#[test]
fn skip_remove_leaves_snapshot_and_zero_device() {
    let mut runner = RecordingRunner::default();
    let config = DmConfig {
        skip_remove: true,
        ..DmConfig::default()
    };
    let mut proto = DetachProtocol::new(&mut runner, names(), config);
    proto.run(|_| Ok(())).expect("run");
    assert_eq!(proto.state(), ProtocolState::Scrubbed);
    assert_eq!(runner.count("dmsetup remove vg0-snap-cow-zero"), 0);
    assert!(!runner.lines().iter().any(|l| l.starts_with("lvremove")));
}

#[test]
fn scrub_failure_skips_removal() {
    let mut runner = RecordingRunner::default();
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let err = proto
        .run(|_| Err::<(), _>(LvsError::MetadataInvalid("bad magic".into())))
        .expect_err("scrub fails");
    assert_eq!(err.kind(), ErrorKind::MetadataInvalid);
    assert_eq!(proto.state(), ProtocolState::CowResumed);
    assert!(!runner.lines().iter().any(|l| l.starts_with("lvremove")));
}

#[test]
fn steps_out_of_order_are_rejected() {
    let mut runner = RecordingRunner::default();
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let err = proto.teardown().expect_err("not scrubbed");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailure);
    assert!(runner.calls.is_empty());
}

#[test]
fn protocol_drives_scrub_of_zero_device() {
    let mut image = vec![0xAB_u8; 4096 * 4];
    image[..4096].fill(0);
    image[4096..8192].fill(0);
    let header = CowHeader {
        magic: COW_DISK_MAGIC,
        valid: 1,
        version: 1,
        chunk_size_sectors: 8,
    };
    image[..16].copy_from_slice(&header.to_le_bytes());
    let live = DiskException {
        old_chunk: 7,
        new_chunk: 3,
    };
    image[4096..4112].copy_from_slice(&live.to_le_bytes());
    let zero_dev = MemoryBlockDevice::from_bytes(image, BlockSize::SECTOR);

    let mut runner = RecordingRunner::default();
    let mut proto = DetachProtocol::new(&mut runner, names(), DmConfig::default());
    let config = ScrubConfig {
        mode: ScrubMode::Zero,
        direct_io: false,
        ..ScrubConfig::default()
    };
    let summary = proto
        .run(|_| scrub_device(&zero_dev, &config, &mut NullReporter))
        .expect("run");
    assert_eq!(summary.exceptions, 1);
    assert!(zero_dev.contents()[3 * 4096..].iter().all(|&b| b == 0));
    assert!(zero_dev.contents()[2 * 4096..3 * 4096].iter().all(|&b| b == 0xAB));
}
