//! Error types for the Function Compute client.

use thiserror::Error;

/// Errors raised by [`super::FcClient`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FcError {
    /// Raised when the client cannot be built from its settings.
    #[error("invalid Function Compute settings: {0}")]
    Config(String),
    /// Raised when the request could not be signed.
    #[error("failed to sign request: {message}")]
    Signing {
        /// Signer message.
        message: String,
    },
    /// Raised when the request never produced a response.
    #[error("request to {path} failed: {message}")]
    Transport {
        /// Request path.
        path: String,
        /// HTTP client message.
        message: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("{method} {path} returned {status} {code}: {message}")]
    Api {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Error code reported by the API, when present.
        code: String,
        /// Error message reported by the API, or the raw body.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("unexpected response from {path}: {message}")]
    Decode {
        /// Request path.
        path: String,
        /// Decoder message.
        message: String,
    },
}

impl FcError {
    /// Returns `true` when the API reported that the resource is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}
