//! Object storage access through the `ossutil` command-line tool.

use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;

use camino::Utf8Path;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::command::{CommandError, CommandOutput, CommandRunner};

/// Marker `ossutil` prints when a bucket does not exist.
pub const NO_SUCH_BUCKET: &str = "NoSuchBucket";

/// Default `ossutil` binary name.
pub const DEFAULT_OSSUTIL_BIN: &str = "ossutil64";

/// Errors raised by object storage operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    /// The storage tool failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// A bucket still holds objects when it was expected to be empty.
    #[error("bucket {bucket} is not empty: {remaining} object(s) remain")]
    BucketNotEmpty {
        /// Bucket name.
        bucket: String,
        /// Number of objects left behind.
        remaining: usize,
    },
    /// The private `ossutil` configuration file could not be written.
    #[error("failed to write ossutil configuration: {message}")]
    Config {
        /// Underlying error message.
        message: String,
    },
}

/// Operations the pipeline needs from object storage.
pub trait ObjectStorage {
    /// Returns `true` when `bucket` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when existence cannot be determined.
    fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Creates a private bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when creation fails.
    fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Uploads `source` as `bucket/key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the upload fails.
    fn put(&self, bucket: &str, key: &str, source: &Utf8Path) -> Result<(), StorageError>;

    /// Downloads `bucket/key` to `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the download fails.
    fn get(&self, bucket: &str, key: &str, dest: &Utf8Path) -> Result<(), StorageError>;

    /// Deletes `bucket/key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the deletion fails.
    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Lists object keys in `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when listing fails.
    fn list(&self, bucket: &str) -> Result<Vec<String>, StorageError>;

    /// Deletes an empty bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the deletion fails.
    fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError>;
}

/// Connection settings for [`OssUtilStorage`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OssUtilSettings {
    /// Path or name of the `ossutil` binary.
    pub bin: String,
    /// Endpoint reachable from this machine.
    pub endpoint: String,
    /// Access key identifier.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
}

/// [`ObjectStorage`] backed by the `ossutil` CLI.
///
/// Endpoint and keys live in a private configuration file passed with `-c`,
/// so the secret never appears in the process list.
#[derive(Clone, Debug)]
pub struct OssUtilStorage<R: CommandRunner> {
    bin: String,
    config: Arc<NamedTempFile>,
    runner: R,
}

impl<R: CommandRunner> OssUtilStorage<R> {
    /// Creates a storage client using `runner` to invoke `ossutil`. The
    /// configuration file is removed when the last clone is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when the configuration file cannot
    /// be written.
    pub fn new(settings: OssUtilSettings, runner: R) -> Result<Self, StorageError> {
        let config_err = |err: std::io::Error| StorageError::Config {
            message: err.to_string(),
        };
        let mut config = tempfile::Builder::new()
            .prefix("prewarm-ossutil-")
            .suffix(".cfg")
            .tempfile()
            .map_err(config_err)?;
        write!(
            config,
            "[Credentials]\nlanguage=EN\nendpoint={}\naccessKeyID={}\naccessKeySecret={}\n",
            settings.endpoint, settings.access_key_id, settings.access_key_secret
        )
        .and_then(|()| config.flush())
        .map_err(config_err)?;
        Ok(Self {
            bin: settings.bin,
            config: Arc::new(config),
            runner,
        })
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let mut argv: Vec<OsString> = args.iter().map(OsString::from).collect();
        argv.push(OsString::from("-c"));
        argv.push(self.config.path().as_os_str().to_owned());
        self.runner.run(&self.bin, &argv)
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput, StorageError> {
        Ok(self.run(args)?.check(&self.bin)?)
    }
}

fn bucket_url(bucket: &str) -> String {
    format!("oss://{bucket}")
}

fn object_url(bucket: &str, key: &str) -> String {
    format!("oss://{bucket}/{key}")
}

impl<R: CommandRunner> ObjectStorage for OssUtilStorage<R> {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let output = self.run(&["stat", &bucket_url(bucket)])?;
        if output.is_success() {
            return Ok(true);
        }
        if output.stderr.contains(NO_SUCH_BUCKET) || output.stdout.contains(NO_SUCH_BUCKET) {
            return Ok(false);
        }
        output.check(&self.bin)?;
        Ok(false)
    }

    fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.run_checked(&[
            "mb",
            &bucket_url(bucket),
            "--acl",
            "private",
            "--storage-class",
            "Standard",
            "--redundancy-type",
            "LRS",
        ])?;
        tracing::info!(bucket, "bucket created");
        Ok(())
    }

    fn put(&self, bucket: &str, key: &str, source: &Utf8Path) -> Result<(), StorageError> {
        self.run_checked(&["cp", source.as_str(), &object_url(bucket, key), "-f"])?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str, dest: &Utf8Path) -> Result<(), StorageError> {
        self.run_checked(&["cp", &object_url(bucket, key), dest.as_str(), "-f"])?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.run_checked(&["rm", &object_url(bucket, key), "-f"])?;
        Ok(())
    }

    fn list(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let output = self.run_checked(&["ls", &bucket_url(bucket), "-s"])?;
        let prefix = format!("{}/", bucket_url(bucket));
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(prefix.as_str()))
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.run_checked(&["rm", &bucket_url(bucket), "-b", "-f"])?;
        tracing::info!(bucket, "bucket deleted");
        Ok(())
    }
}
