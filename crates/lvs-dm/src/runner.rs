//! External command execution.

use lvs_error::{LvsError, Result};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// One external command: program, arguments, and optional stdin text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs volume-management commands.
///
/// A non-zero exit must be returned as [`LvsError::Command`]; a command
/// that cannot be started as [`LvsError::CommandSpawn`].
pub trait CommandRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput> {
        let command = invocation.to_string();
        debug!(%command, "running");

        let spawn_err = |source| LvsError::CommandSpawn {
            command: command.clone(),
            source,
        };
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.as_deref(), child.stdin.take()) {
            trace!(%command, input, "writing stdin");
            pipe.write_all(input.as_bytes()).map_err(spawn_err)?;
        }

        let output = child.wait_with_output().map_err(spawn_err)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();

        if !output.status.success() {
            return Err(LvsError::Command {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Fail unless the process runs with an effective uid of 0.
pub fn ensure_privileged() -> Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(LvsError::PermissionDenied(
            "device-mapper operations require root".to_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvs_error::ErrorKind;

    #[test]
    fn invocation_display_joins_args() {
        let inv = Invocation::new("dmsetup")
            .arg("load")
            .arg("vg-snap-cow")
            .stdin("0 8 error\n");
        assert_eq!(inv.to_string(), "dmsetup load vg-snap-cow");
        assert_eq!(inv.stdin.as_deref(), Some("0 8 error\n"));
    }

    #[test]
    fn system_runner_captures_stdout_and_stdin() {
        let out = SystemCommandRunner
            .run(&Invocation::new("cat").stdin("0 204800 linear 8:16 2048\n"))
            .expect("cat");
        assert_eq!(out.stdout, "0 204800 linear 8:16 2048\n");
    }

    #[test]
    fn system_runner_reports_nonzero_exit() {
        let err = SystemCommandRunner
            .run(&Invocation::new("false"))
            .expect_err("false exits 1");
        assert!(matches!(err, LvsError::Command { ref command, .. } if command == "false"));
        assert_eq!(err.kind(), ErrorKind::CommandFailure);
    }

    #[test]
    fn system_runner_reports_missing_program() {
        let err = SystemCommandRunner
            .run(&Invocation::new("/nonexistent/lvscrub-dmsetup"))
            .expect_err("missing");
        assert!(matches!(err, LvsError::CommandSpawn { .. }));
    }
}
