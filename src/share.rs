//! Network share access through the Serverless Devs `s nas` commands.

use std::ffi::OsString;

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::command::{CommandError, CommandRunner};

/// Default Serverless Devs binary name.
pub const DEFAULT_S_BIN: &str = "s";

/// Errors raised by network share operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShareError {
    /// The share tool failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// A pull reported success but left no local file behind.
    #[error("download of {remote} to {local} produced no file")]
    Missing {
        /// Remote path that was pulled.
        remote: String,
        /// Local destination.
        local: String,
    },
    /// A local file could not be prepared for a pull.
    #[error("failed to prepare {path}: {message}")]
    Local {
        /// Local path.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Operations the pipeline needs from a mounted network share.
pub trait NetworkShare {
    /// Copies `remote` from the share to `local`.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError`] when the copy fails or produces nothing.
    fn pull(&self, remote: &str, local: &Utf8Path) -> Result<(), ShareError>;

    /// Copies `local` onto the share at `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError`] when the copy fails.
    fn push(&self, local: &Utf8Path, remote: &str) -> Result<(), ShareError>;

    /// Recursively removes `remote` from the share.
    ///
    /// # Errors
    ///
    /// Returns [`ShareError`] when the removal fails.
    fn clear(&self, remote: &str) -> Result<(), ShareError>;
}

/// [`NetworkShare`] backed by the `s nas` CLI.
#[derive(Clone, Debug)]
pub struct ServerlessDevsShare<R: CommandRunner> {
    bin: String,
    runner: R,
}

impl<R: CommandRunner> ServerlessDevsShare<R> {
    /// Creates a share client invoking `bin` through `runner`.
    #[must_use]
    pub fn new(bin: impl Into<String>, runner: R) -> Self {
        Self {
            bin: bin.into(),
            runner,
        }
    }

    fn run_nas(&self, args: &[&str]) -> Result<(), ShareError> {
        let mut argv = vec![OsString::from("nas")];
        argv.extend(args.iter().map(OsString::from));
        let output = self.runner.run(&self.bin, &argv)?;
        output.check(&self.bin)?;
        Ok(())
    }
}

impl<R: CommandRunner> NetworkShare for ServerlessDevsShare<R> {
    fn pull(&self, remote: &str, local: &Utf8Path) -> Result<(), ShareError> {
        if local.exists() {
            std::fs::remove_file(local).map_err(|err| ShareError::Local {
                path: local.to_string(),
                message: err.to_string(),
            })?;
        }

        self.run_nas(&["download", remote, local.as_str()])?;

        if !local.exists() {
            return Err(ShareError::Missing {
                remote: remote.to_owned(),
                local: local.to_string(),
            });
        }
        tracing::info!(remote, local = %local, "pulled file from network share");
        Ok(())
    }

    fn push(&self, local: &Utf8Path, remote: &str) -> Result<(), ShareError> {
        self.run_nas(&["upload", local.as_str(), remote])
    }

    fn clear(&self, remote: &str) -> Result<(), ShareError> {
        let escaped = escape(remote.into());
        tracing::info!(remote, "clearing shared path before invocation");
        self.run_nas(&["command", "rm", "-rf", escaped.as_ref()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    fn clear_escapes_the_remote_path() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let share = ServerlessDevsShare::new(DEFAULT_S_BIN, runner.clone());

        share.clear("/mnt/auto/my dir").expect("clear");

        let calls = runner.invocations();
        assert_eq!(
            calls.first().map(|call| call.command_string()),
            Some(String::from("s nas command rm -rf '/mnt/auto/my dir'"))
        );
    }

    #[rstest]
    fn pull_without_local_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let local = Utf8PathBuf::from_path_buf(dir.path().join("srctl.tar.gz")).expect("utf8");
        let runner = ScriptedRunner::new();
        runner.push_success();
        let share = ServerlessDevsShare::new(DEFAULT_S_BIN, runner.clone());

        let err = share
            .pull("/mnt/auto/srctl.tar.gz", &local)
            .expect_err("missing download should fail");

        assert!(matches!(err, ShareError::Missing { .. }));
        assert_eq!(
            runner.invocations().first().map(|call| call.command_string()),
            Some(format!("s nas download /mnt/auto/srctl.tar.gz {local}"))
        );
    }

    #[rstest]
    fn failed_upload_surfaces_command_error() {
        let runner = ScriptedRunner::new();
        runner.push_failure(2);
        let share = ServerlessDevsShare::new(DEFAULT_S_BIN, runner);

        let err = share
            .push(Utf8Path::new("/tmp/a"), "/mnt/auto/a")
            .expect_err("upload should fail");

        assert_eq!(
            err.to_string(),
            "s exited with status 2: simulated failure"
        );
    }
}
