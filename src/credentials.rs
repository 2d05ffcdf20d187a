//! Cloud account credentials.
//!
//! Credentials either come straight from configuration or from a local TOML
//! profile store (`~/.prewarm/credentials.toml`, overridable through
//! `PREWARM_CREDENTIALS_PATH`). The store is plain text; protect it with file
//! permissions. When no profile can be found the provider fails closed by
//! returning empty credentials, which callers reject before contacting the
//! platform.

use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use thiserror::Error;

/// Environment variable overriding the profile store location.
pub const CREDENTIALS_PATH_ENV: &str = "PREWARM_CREDENTIALS_PATH";

/// Profile used when none is requested and a `default` table exists.
pub const DEFAULT_PROFILE: &str = "default";

/// Account identity and access keys.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Credentials {
    /// Account identifier, used to build the platform endpoint.
    pub account_id: String,
    /// Access key identifier.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Builds credentials from their parts.
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        }
    }

    /// Returns `true` when any part is blank.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        [&self.account_id, &self.access_key_id, &self.access_key_secret]
            .iter()
            .any(|value| value.trim().is_empty())
    }
}

/// Errors raised while reading the profile store.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// The store exists but could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Store location.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// The store is not valid TOML or has an unexpected shape.
    #[error("invalid credentials in {path}: {message}")]
    Invalid {
        /// Store location.
        path: Utf8PathBuf,
        /// What was wrong.
        message: String,
    },
}

/// Source of credentials.
pub trait CredentialProvider {
    /// Resolves credentials for `profile`, or the default profile.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when a present store cannot be read.
    fn credentials(&self, profile: Option<&str>) -> Result<Credentials, CredentialError>;
}

/// Provider returning a fixed credential set.
#[derive(Clone, Debug)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    /// Wraps explicit credentials.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, _profile: Option<&str>) -> Result<Credentials, CredentialError> {
        Ok(self.0.clone())
    }
}

/// Provider reading named tables from a TOML file.
///
/// ```toml
/// [default]
/// account_id = "1234567890"
/// access_key_id = "LTAI..."
/// access_key_secret = "..."
/// ```
#[derive(Clone, Debug)]
pub struct ProfileCredentialStore {
    path: Utf8PathBuf,
}

impl ProfileCredentialStore {
    /// Uses an explicit store location.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolves the store from `PREWARM_CREDENTIALS_PATH` or the home
    /// directory. Returns `None` when neither is available.
    #[must_use]
    pub fn discover() -> Option<Self> {
        if let Ok(path) = std::env::var(CREDENTIALS_PATH_ENV) {
            return Some(Self::new(path));
        }
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .ok()?;
        Some(Self::new(
            Utf8PathBuf::from(home).join(".prewarm").join("credentials.toml"),
        ))
    }

    /// Store location.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read(&self) -> Result<Option<String>, CredentialError> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let Some(file_name) = self.path.file_name() else {
            return Ok(None);
        };
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(&err)),
        };
        match dir.read_to_string(file_name) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(&err)),
        }
    }

    fn io_error(&self, err: &io::Error) -> CredentialError {
        CredentialError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }

    fn invalid(&self, message: impl Into<String>) -> CredentialError {
        CredentialError::Invalid {
            path: self.path.clone(),
            message: message.into(),
        }
    }
}

impl CredentialProvider for ProfileCredentialStore {
    fn credentials(&self, profile: Option<&str>) -> Result<Credentials, CredentialError> {
        let Some(contents) = self.read()? else {
            tracing::warn!(path = %self.path, "credential store not found");
            return Ok(Credentials::default());
        };
        let value: toml::Value =
            toml::from_str(&contents).map_err(|err| self.invalid(err.to_string()))?;
        let root = value
            .as_table()
            .ok_or_else(|| self.invalid("root is not a table"))?;

        let selected = match profile {
            Some(name) => root.get(name),
            None => root.get(DEFAULT_PROFILE).or_else(|| root.values().next()),
        };
        let Some(section) = selected else {
            tracing::warn!(path = %self.path, profile, "credential profile not found");
            return Ok(Credentials::default());
        };
        let table = section
            .as_table()
            .ok_or_else(|| self.invalid("profile is not a table"))?;

        let field = |key: &str| -> Result<String, CredentialError> {
            table.get(key).map_or(Ok(String::new()), |raw| {
                raw.as_str()
                    .map(|text| text.trim().to_owned())
                    .ok_or_else(|| self.invalid(format!("{key} must be a string")))
            })
        };
        Ok(Credentials {
            account_id: field("account_id")?,
            access_key_id: field("access_key_id")?,
            access_key_secret: field("access_key_secret")?,
        })
    }
}
