//! Chunked retrieval of remote files over a bounded request/response channel.
//!
//! The helper function cannot return arbitrarily large bodies, so the client
//! first asks for the file size and then pulls fixed-size, base64-encoded
//! ranges until the whole file has been accumulated. The buffer reaches disk
//! in a single write once every range has arrived; a failure at any point
//! leaves the destination untouched.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use thiserror::Error;

use crate::platform::{ComputePlatform, PlatformFuture};
use crate::protocol::HelperCommand;
use crate::share::ShareError;
use crate::storage::StorageError;

/// Default range length: 3 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 3 * 1024 * 1024;

/// Errors raised while moving the acceleration archive.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The size response was not a non-negative decimal integer.
    #[error("invalid size response: {body:?}")]
    InvalidSize {
        /// Raw response body.
        body: String,
    },
    /// The configured chunk size was zero.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// A range decoded to a different length than requested.
    #[error("chunk at offset {offset} decoded to {actual} bytes, expected {expected}")]
    ChunkLengthMismatch {
        /// Offset of the offending range.
        offset: u64,
        /// Requested length.
        expected: u64,
        /// Decoded length.
        actual: u64,
    },
    /// A range response was not valid base64.
    #[error("chunk at offset {offset} is not valid base64: {message}")]
    Decode {
        /// Offset of the offending range.
        offset: u64,
        /// Decoder message.
        message: String,
    },
    /// The invocation channel failed.
    #[error("invocation failed: {message}")]
    Channel {
        /// Channel error message.
        message: String,
    },
    /// Writing the retrieved file failed.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Destination path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// The object storage route failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The network share route failed.
    #[error(transparent)]
    Share(#[from] ShareError),
}

/// Future returned by invocation channels.
pub type ChannelFuture<'a, E> = PlatformFuture<'a, String, E>;

/// Request/response primitive that carries helper commands.
pub trait InvocationChannel {
    /// Error type surfaced by the channel.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends a command and returns the raw response body.
    fn call<'a>(&'a self, command: &'a HelperCommand) -> ChannelFuture<'a, Self::Error>;
}

/// Channel that routes helper commands through a deployed function's HTTP
/// trigger.
#[derive(Debug)]
pub struct FunctionChannel<'p, P> {
    platform: &'p P,
    service: String,
    function: String,
}

impl<'p, P> FunctionChannel<'p, P> {
    /// Binds the channel to a service and function.
    #[must_use]
    pub fn new(platform: &'p P, service: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            platform,
            service: service.into(),
            function: function.into(),
        }
    }
}

impl<P> InvocationChannel for FunctionChannel<'_, P>
where
    P: ComputePlatform + Sync,
{
    type Error = P::Error;

    fn call<'a>(&'a self, command: &'a HelperCommand) -> ChannelFuture<'a, Self::Error> {
        self.platform.invoke(
            &self.service,
            &self.function,
            command.path(),
            command.encode(),
        )
    }
}

/// Byte range requested in one step of a transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkRange {
    /// Offset of the first byte.
    pub offset: u64,
    /// Number of bytes requested.
    pub length: u64,
}

/// Accumulated state for a single chunked download.
#[derive(Clone, Debug)]
pub struct TransferSession {
    buffer: Vec<u8>,
    transferred: u64,
    total: u64,
    chunk_size: u64,
}

impl TransferSession {
    /// Starts a session for a file of `total` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidChunkSize`] when `chunk_size` is zero.
    pub fn new(total: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self {
            // The total comes from the remote side; reserve one range at most.
            buffer: Vec::with_capacity(usize::try_from(total.min(chunk_size)).unwrap_or(0)),
            transferred: 0,
            total,
            chunk_size,
        })
    }

    /// Returns the next range to request, or `None` once complete.
    #[must_use]
    pub fn next_range(&self) -> Option<ChunkRange> {
        let remaining = self.total.saturating_sub(self.transferred);
        (remaining > 0).then(|| ChunkRange {
            offset: self.transferred,
            length: remaining.min(self.chunk_size),
        })
    }

    /// Appends a decoded range and advances by its logical length.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ChunkLengthMismatch`] when `bytes` does not
    /// match the requested length.
    pub fn accept(&mut self, range: ChunkRange, bytes: &[u8]) -> Result<(), TransferError> {
        let actual = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        if actual != range.length {
            return Err(TransferError::ChunkLengthMismatch {
                offset: range.offset,
                expected: range.length,
                actual,
            });
        }
        self.buffer.extend_from_slice(bytes);
        self.transferred += range.length;
        Ok(())
    }

    /// Bytes received so far.
    #[must_use]
    pub const fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Total size announced by the remote side.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Returns `true` once every byte has arrived.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.transferred == self.total
    }

    /// Consumes the session and yields the accumulated bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Pulls remote files through an [`InvocationChannel`] in fixed-size ranges.
#[derive(Clone, Copy, Debug)]
pub struct ChunkedDownloader {
    chunk_size: u64,
}

impl Default for ChunkedDownloader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkedDownloader {
    /// Creates a downloader with the given range length.
    #[must_use]
    pub const fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    /// Downloads `remote_file` and writes it to `dest`, returning the number
    /// of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the size response is malformed, a range
    /// fails or decodes to the wrong length, or the destination write fails.
    pub async fn download<C>(
        &self,
        channel: &C,
        remote_file: &str,
        dest: &Utf8Path,
    ) -> Result<u64, TransferError>
    where
        C: InvocationChannel + Sync,
    {
        let bytes = self.fetch(channel, remote_file).await?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|err| TransferError::Io {
                path: dest.to_string(),
                message: err.to_string(),
            })?;
        Ok(u64::try_from(bytes.len()).unwrap_or(u64::MAX))
    }

    /// Retrieves `remote_file` into memory.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] under the same conditions as
    /// [`Self::download`], minus the destination write.
    pub async fn fetch<C>(&self, channel: &C, remote_file: &str) -> Result<Vec<u8>, TransferError>
    where
        C: InvocationChannel + Sync,
    {
        let size_query = HelperCommand::Size {
            file: remote_file.to_owned(),
        };
        let body = channel
            .call(&size_query)
            .await
            .map_err(|err| channel_error(&err))?;
        let total = parse_size(&body)?;
        tracing::info!(file = remote_file, size = total, "archive size reported");

        let mut session = TransferSession::new(total, self.chunk_size)?;
        while let Some(range) = session.next_range() {
            tracing::debug!(
                file = remote_file,
                offset = range.offset,
                length = range.length,
                "requesting chunk"
            );
            let request = HelperCommand::Range {
                file: remote_file.to_owned(),
                start: range.offset,
                size: range.length,
            };
            let encoded = channel
                .call(&request)
                .await
                .map_err(|err| channel_error(&err))?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|err| TransferError::Decode {
                    offset: range.offset,
                    message: err.to_string(),
                })?;
            session.accept(range, &bytes)?;
        }

        Ok(session.into_bytes())
    }
}

/// Parses the decimal size reported by the helper.
///
/// # Errors
///
/// Returns [`TransferError::InvalidSize`] when `body` is not a run of ASCII
/// digits after trimming surrounding whitespace, or overflows `u64`.
pub fn parse_size(body: &str) -> Result<u64, TransferError> {
    let invalid = || TransferError::InvalidSize {
        body: body.to_owned(),
    };
    let digits = body.trim();
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse::<u64>().map_err(|_| invalid())
}

fn channel_error(err: &dyn std::error::Error) -> TransferError {
    TransferError::Channel {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests;
