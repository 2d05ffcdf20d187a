//! Transfer route selection.
//!
//! A [`TransferRoute`] decides how the helper's code package reaches the
//! platform and how the generated archive comes back: inline and chunked
//! through the function itself, through a transient object storage bucket,
//! or through a mounted network share.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use thiserror::Error;

use crate::archive::read_archive;
use crate::ledger::ResourceLedger;
use crate::platform::{ComputePlatform, FunctionCode};
use crate::protocol::{ARCHIVE_NAME, REMOTE_ARCHIVE_PATH};
use crate::share::NetworkShare;
use crate::storage::ObjectStorage;
use crate::transfer::{ChunkedDownloader, FunctionChannel, TransferError};

/// Object key the helper's code package is uploaded under.
pub const CODE_OBJECT_NAME: &str = "tmp-func.zip";

/// How the archive moves between this machine and the helper.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransferRoute {
    /// Inline code upload and chunked download through the function.
    #[default]
    Direct,
    /// Code and archive pass through a transient bucket.
    ObjectStorage,
    /// The helper writes the archive to a mounted network share.
    NetworkShare,
}

/// Raised when a route name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown route {value:?}: expected direct, object-storage, or network-share")]
pub struct RouteError {
    /// Rejected value.
    pub value: String,
}

impl FromStr for TransferRoute {
    type Err = RouteError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "object-storage" | "oss" => Ok(Self::ObjectStorage),
            "network-share" | "nas" => Ok(Self::NetworkShare),
            _ => Err(RouteError {
                value: value.to_owned(),
            }),
        }
    }
}

impl fmt::Display for TransferRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::ObjectStorage => "object-storage",
            Self::NetworkShare => "network-share",
        })
    }
}

/// Collaborators and names needed to bring the archive back.
#[derive(Debug)]
pub struct Retrieval<'a, P, S, N> {
    /// Platform hosting the helper.
    pub platform: &'a P,
    /// Object storage client.
    pub storage: &'a S,
    /// Network share client.
    pub share: &'a N,
    /// Helper service name.
    pub service: &'a str,
    /// Helper function name.
    pub function: &'a str,
    /// Transient bucket name.
    pub bucket: &'a str,
    /// Archive location on the function side.
    pub remote_file: &'a str,
    /// Range length for direct downloads.
    pub chunk_size: u64,
}

impl TransferRoute {
    /// Where the helper writes the archive. `None` when the network share
    /// route has no mount directory.
    #[must_use]
    pub fn archive_location(self, nas_mount_dir: Option<&str>) -> Option<String> {
        match self {
            Self::Direct | Self::ObjectStorage => Some(String::from(REMOTE_ARCHIVE_PATH)),
            Self::NetworkShare => nas_mount_dir
                .map(|mount| format!("{}/{ARCHIVE_NAME}", mount.trim_end_matches('/'))),
        }
    }

    /// Returns `true` when the helper needs object storage credentials.
    #[must_use]
    pub const fn uploads_to_storage(self) -> bool {
        matches!(self, Self::ObjectStorage)
    }

    /// Makes the code package available to the platform.
    ///
    /// The object storage route creates `bucket` when absent, recording it,
    /// and uploads the package, recording the object, before returning a
    /// reference to it. The other routes inline the package.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the package cannot be read or the
    /// storage calls fail.
    pub fn provision_code<S: ObjectStorage>(
        self,
        storage: &S,
        bucket: &str,
        package: &Utf8Path,
        ledger: &mut ResourceLedger,
    ) -> Result<FunctionCode, TransferError> {
        if self != Self::ObjectStorage {
            let bytes = read_archive(package).map_err(|err| TransferError::Io {
                path: package.to_string(),
                message: err.to_string(),
            })?;
            return Ok(FunctionCode::Inline {
                zip_base64: STANDARD.encode(bytes),
            });
        }

        if storage.bucket_exists(bucket)? {
            tracing::info!(bucket, "reusing existing bucket");
        } else {
            storage.create_bucket(bucket)?;
            ledger.record_bucket(bucket);
        }
        storage.put(bucket, CODE_OBJECT_NAME, package)?;
        ledger.record_object(bucket, CODE_OBJECT_NAME);
        tracing::info!(bucket, object = CODE_OBJECT_NAME, "code package uploaded");
        Ok(FunctionCode::ObjectStorage {
            bucket: bucket.to_owned(),
            object: String::from(CODE_OBJECT_NAME),
        })
    }

    /// Clears stale data before the helper runs. Only the network share
    /// route has anything to clear.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Share`] when the share command fails.
    pub fn prepare<N: NetworkShare>(
        self,
        share: &N,
        remote_path: &str,
        remote_file: &str,
    ) -> Result<(), TransferError> {
        if self == Self::NetworkShare {
            share.clear(remote_path)?;
            share.clear(remote_file)?;
        }
        Ok(())
    }

    /// Brings the generated archive to `dest`, returning its size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the route's download mechanism fails.
    pub async fn retrieve<P, S, N>(
        self,
        from: &Retrieval<'_, P, S, N>,
        dest: &Utf8Path,
        ledger: &mut ResourceLedger,
    ) -> Result<u64, TransferError>
    where
        P: ComputePlatform + Sync,
        S: ObjectStorage,
        N: NetworkShare,
    {
        tracing::info!(route = %self, dest = %dest, "retrieving archive");
        match self {
            Self::Direct => {
                let channel = FunctionChannel::new(from.platform, from.service, from.function);
                ChunkedDownloader::new(from.chunk_size)
                    .download(&channel, from.remote_file, dest)
                    .await
            }
            Self::ObjectStorage => {
                ledger.record_object(from.bucket, ARCHIVE_NAME);
                from.storage.get(from.bucket, ARCHIVE_NAME, dest)?;
                from.storage.delete(from.bucket, ARCHIVE_NAME)?;
                ledger.discharge_object(from.bucket, ARCHIVE_NAME);
                file_size(dest)
            }
            Self::NetworkShare => {
                from.share.pull(from.remote_file, dest)?;
                file_size(dest)
            }
        }
    }
}

fn file_size(path: &Utf8Path) -> Result<u64, TransferError> {
    std::fs::metadata(path)
        .map(|metadata| metadata.len())
        .map_err(|err| TransferError::Io {
            path: path.to_string(),
            message: err.to_string(),
        })
}
