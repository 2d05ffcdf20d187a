//! External command execution.
//!
//! Every collaborator that is reached through a CLI (the object storage
//! utility, the network share tooling, and runtime build tools) goes through
//! [`CommandRunner`] so tests can script outcomes without spawning processes.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Exit code zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Passes a zero exit through and turns anything else into
    /// [`CommandError::Failure`] carrying the trimmed stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failure`] for a non-zero or missing exit code.
    pub fn check(self, program: &str) -> Result<Self, CommandError> {
        if self.is_success() {
            return Ok(self);
        }
        let status_text = match self.code {
            Some(code) => code.to_string(),
            None => String::from("unknown"),
        };
        Err(CommandError::Failure {
            program: program.to_owned(),
            status: self.code,
            status_text,
            stderr: self.stderr.trim().to_owned(),
        })
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The binary could not be started, usually because it is not on `PATH`.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Binary that was invoked.
        program: String,
        /// OS error text.
        message: String,
    },
    /// The binary ran and reported failure.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failure {
        /// Binary that was invoked.
        program: String,
        /// Exit code; `None` when killed by a signal.
        status: Option<i32>,
        /// Exit code rendered for messages.
        status_text: String,
        /// Trimmed stderr.
        stderr: String,
    },
}

/// Runs external binaries. Storage, share, and build tooling all go through
/// this seam.
pub trait CommandRunner {
    /// Runs `program` with `args` to completion and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        tracing::debug!(program, args = ?args, "running external command");
        let spawn_error = |err: std::io::Error| CommandError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        };
        let output = Command::new(program).args(args).output().map_err(spawn_error)?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl<R: CommandRunner> CommandRunner for &R {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), true)]
    #[case(Some(1), false)]
    #[case(None, false)]
    fn is_success_only_for_zero(#[case] code: Option<i32>, #[case] expected: bool) {
        let output = CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.is_success(), expected);
    }

    #[test]
    fn check_reports_status_and_stderr() {
        let output = CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: String::from("boom\n"),
        };
        let err = output.check("ossutil64").expect_err("should fail");
        assert_eq!(err.to_string(), "ossutil64 exited with status unknown: boom");
    }

    #[test]
    fn process_runner_reports_spawn_failure() {
        let err = ProcessCommandRunner
            .run("prewarm-definitely-missing-binary", &[])
            .expect_err("spawn should fail");
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
