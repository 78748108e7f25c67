#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use lvs_core::{Detail, ScrubConfig, ScrubMode, ScrubSummary, TracingReporter, scrub_path};
use lvs_dm::{
    DM_DIR, DetachProtocol, DmConfig, SnapshotNames, SystemCommandRunner, ensure_privileged,
};
use lvs_error::LvsError;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "lvscrub",
    version,
    about = "Zero the exception chunks of an LVM snapshot before removing it"
)]
struct Cli {
    /// Snapshot logical volume (`/dev/<vg>/<lv>` or `/dev/mapper/<name>`).
    snapshot: PathBuf,

    /// Increase verbosity; `-vv` also dumps each chunk before zeroing.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Report exceptions without writing anything.
    #[arg(short, long)]
    display_only: bool,

    /// Leave the snapshot and the zero device in place after scrubbing.
    #[arg(short, long)]
    skip_remove: bool,

    /// Treat SNAPSHOT as a COW device or image and scrub it directly.
    #[arg(long)]
    raw: bool,

    /// Give up after this many exception stores.
    #[arg(long, value_name = "N")]
    max_stores: Option<u64>,

    /// Request alignment in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = 512)]
    block_size: u32,

    /// Use buffered I/O instead of O_DIRECT.
    #[arg(long)]
    no_direct: bool,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn scrub_config(&self) -> ScrubConfig {
        ScrubConfig {
            mode: if self.display_only {
                ScrubMode::DisplayOnly
            } else {
                ScrubMode::Zero
            },
            detail: match self.verbose {
                0 => Detail::Quiet,
                1 => Detail::Plain,
                _ => Detail::Contents,
            },
            block_size: self.block_size,
            direct_io: !self.no_direct,
            max_stores: self.max_stores,
            ..ScrubConfig::default()
        }
    }

    fn dm_config(&self) -> DmConfig {
        DmConfig {
            skip_remove: self.skip_remove,
            ..DmConfig::default()
        }
    }

    /// Display-only runs log at `info` at least.
    fn log_filter(&self) -> &'static str {
        match (self.verbose, self.display_only) {
            (0, false) => "warn",
            (0 | 1, _) => "info",
            (2, _) => "debug",
            _ => "trace",
        }
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(error) = run(&cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if !cli.snapshot.exists() {
        return Err(LvsError::Precondition(format!(
            "snapshot {} does not exist",
            cli.snapshot.display()
        ))
        .into());
    }

    let config = cli.scrub_config();
    let mut reporter = TracingReporter::new(config.effective_detail());

    let summary = if cli.raw {
        scrub_path(&cli.snapshot, &config, &mut reporter)
            .with_context(|| format!("failed to scrub {}", cli.snapshot.display()))?
    } else {
        let names = SnapshotNames::resolve(&cli.snapshot)?;
        ensure_privileged()?;
        if config.mode == ScrubMode::DisplayOnly {
            // Inspect the live COW device read-only; nothing is detached.
            let cow = Path::new(DM_DIR).join(&names.cow);
            scrub_path(&cow, &config, &mut reporter)
                .with_context(|| format!("failed to read {}", cow.display()))?
        } else {
            let mut runner = SystemCommandRunner;
            let mut protocol = DetachProtocol::new(&mut runner, names, cli.dm_config());
            protocol
                .run(|zero| scrub_path(zero, &config, &mut reporter))
                .with_context(|| format!("failed to scrub snapshot {}", cli.snapshot.display()))?
        }
    };

    print_summary(&summary, cli.json)
}

fn print_summary(summary: &ScrubSummary, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serialize summary")?
        );
    } else {
        println!("{summary}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lvscrub").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn defaults_zero_with_direct_io() {
        let cli = parse(&["/dev/vg0/snap"]);
        let config = cli.scrub_config();
        assert_eq!(config.mode, ScrubMode::Zero);
        assert_eq!(config.detail, Detail::Quiet);
        assert!(config.direct_io);
        assert_eq!(config.block_size, 512);
        assert!(!cli.dm_config().skip_remove);
        assert_eq!(cli.log_filter(), "warn");
    }

    #[test]
    fn verbosity_count_maps_to_detail_and_level() {
        let cli = parse(&["-vv", "/dev/vg0/snap"]);
        assert_eq!(cli.scrub_config().detail, Detail::Contents);
        assert_eq!(cli.log_filter(), "debug");
        assert_eq!(parse(&["-vvvv", "x"]).log_filter(), "trace");
    }

    #[test]
    fn display_only_raises_level_to_info() {
        let cli = parse(&["-d", "/dev/vg0/snap"]);
        let config = cli.scrub_config();
        assert_eq!(config.mode, ScrubMode::DisplayOnly);
        assert_eq!(config.effective_detail(), Detail::Plain);
        assert_eq!(cli.log_filter(), "info");
    }

    #[test]
    fn flags_reach_configs() {
        let cli = parse(&[
            "-s",
            "--raw",
            "--no-direct",
            "--max-stores",
            "16",
            "--block-size",
            "4096",
            "--json",
            "/tmp/cow.img",
        ]);
        assert!(cli.raw && cli.json);
        assert!(cli.dm_config().skip_remove);
        let config = cli.scrub_config();
        assert!(!config.direct_io);
        assert_eq!(config.max_stores, Some(16));
        assert_eq!(config.block_size, 4096);
    }

    #[test]
    fn snapshot_argument_is_required() {
        assert!(Cli::try_parse_from(["lvscrub", "-d"]).is_err());
    }

    #[test]
    fn missing_snapshot_is_precondition_failure() {
        let cli = parse(&["--raw", "/nonexistent/lvscrub-snap"]);
        let err = run(&cli).expect_err("missing");
        let lvs = err.downcast_ref::<LvsError>().expect("LvsError");
        assert_eq!(lvs.kind(), lvs_error::ErrorKind::PreconditionFailure);
    }
}
