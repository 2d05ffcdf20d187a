//! Command schema spoken to the helper function over HTTP invocations.
//!
//! Request bodies are `key=value` pairs joined by `;`. Values are escaped so
//! that embedded delimiters survive the round trip: `%` becomes `%25`, `;`
//! becomes `%3B`, and `=` becomes `%3D`. Key order matches what the helper
//! expects to read.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

/// Token that prefixes every successful helper response.
pub const SUCCESS_MARKER: &str = "success";

/// File name of the archive the helper produces.
pub const ARCHIVE_NAME: &str = "srctl.tar.gz";

/// Location of the archive inside the helper's sandbox.
pub const REMOTE_ARCHIVE_PATH: &str = "/tmp/srctl.tar.gz";

/// HTTP trigger path that runs the dump.
pub const INVOKE_PATH: &str = "invoke";

/// HTTP trigger path that serves size and range queries.
pub const ACTION_PATH: &str = "action";

/// Credentials and destination the helper uses to upload its archive to
/// object storage instead of holding it locally.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageUpload {
    /// Access key the helper authenticates with.
    pub access_key_id: String,
    /// Secret paired with [`Self::access_key_id`].
    pub access_key_secret: String,
    /// Object storage endpoint reachable from the function.
    pub endpoint: String,
    /// Bucket that receives the archive.
    pub bucket: String,
}

/// Request asking the helper to generate the acceleration archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpRequest {
    /// Directory the instrumented runtime writes its shared data into.
    pub shared_path: String,
    /// Path the archive is written to on the function side.
    pub archive_file: String,
    /// Dump method understood by the runtime (for example `jcmd`).
    pub method: Option<String>,
    /// Upload target when the archive travels through object storage.
    pub storage: Option<StorageUpload>,
}

/// A single command understood by the helper function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HelperCommand {
    /// Ask for the byte length of a file.
    Size {
        /// File to measure.
        file: String,
    },
    /// Ask for a base64-encoded slice of a file.
    Range {
        /// File to read.
        file: String,
        /// Offset of the first byte.
        start: u64,
        /// Number of bytes requested.
        size: u64,
    },
    /// Ask the helper to produce the acceleration archive.
    Dump(DumpRequest),
}

/// Errors raised while decoding a helper request body.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    /// A segment lacked the `=` separator.
    #[error("malformed pair: {pair}")]
    MalformedPair {
        /// Offending segment.
        pair: String,
    },
    /// A `%` escape was truncated or named an unsupported byte.
    #[error("malformed escape in {value}")]
    MalformedEscape {
        /// Raw value containing the escape.
        value: String,
    },
    /// The same key appeared twice.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// Repeated key.
        key: String,
    },
    /// A required key was absent.
    #[error("missing key: {key}")]
    MissingKey {
        /// Key that was expected.
        key: String,
    },
    /// A numeric value did not parse.
    #[error("invalid number for {key}: {value}")]
    InvalidNumber {
        /// Key carrying the value.
        key: String,
        /// Raw value.
        value: String,
    },
    /// The `type` key named an unknown command.
    #[error("unknown command type: {value}")]
    UnknownType {
        /// Raw `type` value.
        value: String,
    },
}

impl HelperCommand {
    /// Returns the trigger path this command is posted to.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Size { .. } | Self::Range { .. } => ACTION_PATH,
            Self::Dump(_) => INVOKE_PATH,
        }
    }

    /// Encodes the command into a request body.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        match self {
            Self::Size { file } => {
                pairs.push(("type", String::from("size")));
                pairs.push(("file", file.clone()));
            }
            Self::Range { file, start, size } => {
                pairs.push(("start", start.to_string()));
                pairs.push(("size", size.to_string()));
                pairs.push(("file", file.clone()));
            }
            Self::Dump(request) => {
                pairs.push(("srpath", request.shared_path.clone()));
                pairs.push(("type", String::from("dump")));
                pairs.push(("file", request.archive_file.clone()));
                if let Some(method) = &request.method {
                    pairs.push(("method", method.clone()));
                }
                if let Some(storage) = &request.storage {
                    pairs.push(("accessKeyId", storage.access_key_id.clone()));
                    pairs.push(("accessKeySecret", storage.access_key_secret.clone()));
                    pairs.push(("endpoint", storage.endpoint.clone()));
                    pairs.push(("bucket", storage.bucket.clone()));
                }
            }
        }

        let mut body = String::new();
        for (key, value) in pairs {
            if !body.is_empty() {
                body.push(';');
            }
            body.push_str(key);
            body.push('=');
            body.push_str(&escape(&value));
        }
        body
    }

    /// Decodes a request body produced by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the body is malformed, repeats a key,
    /// omits a required key, or names an unknown command.
    pub fn decode(body: &str) -> Result<Self, ProtocolError> {
        let mut fields = parse_pairs(body)?;
        let file = take(&mut fields, "file")?;

        match fields.remove("type").as_deref() {
            Some("size") => Ok(Self::Size { file }),
            Some("dump") => {
                let shared_path = take(&mut fields, "srpath")?;
                let method = fields.remove("method");
                let storage = if fields.contains_key("bucket") {
                    Some(StorageUpload {
                        access_key_id: take(&mut fields, "accessKeyId")?,
                        access_key_secret: take(&mut fields, "accessKeySecret")?,
                        endpoint: take(&mut fields, "endpoint")?,
                        bucket: take(&mut fields, "bucket")?,
                    })
                } else {
                    None
                };
                Ok(Self::Dump(DumpRequest {
                    shared_path,
                    archive_file: file,
                    method,
                    storage,
                }))
            }
            Some(other) => Err(ProtocolError::UnknownType {
                value: other.to_owned(),
            }),
            None => Ok(Self::Range {
                file,
                start: take_number(&mut fields, "start")?,
                size: take_number(&mut fields, "size")?,
            }),
        }
    }
}

/// Returns `true` when a helper response reports success.
#[must_use]
pub fn is_success(body: &str) -> bool {
    body.starts_with(SUCCESS_MARKER)
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' | ';' | '=' => {
                write!(escaped, "%{:02X}", u32::from(ch)).ok();
            }
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape(value: &str) -> Result<String, ProtocolError> {
    let malformed = || ProtocolError::MalformedEscape {
        value: value.to_owned(),
    };
    let mut decoded = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            decoded.push(ch);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.to_ascii_uppercase().as_str() {
            "25" => decoded.push('%'),
            "3B" => decoded.push(';'),
            "3D" => decoded.push('='),
            _ => return Err(malformed()),
        }
    }
    Ok(decoded)
}

fn parse_pairs(body: &str) -> Result<BTreeMap<String, String>, ProtocolError> {
    let mut fields = BTreeMap::new();
    for pair in body.split(';').filter(|segment| !segment.is_empty()) {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| ProtocolError::MalformedPair {
                pair: pair.to_owned(),
            })?;
        let value = unescape(raw)?;
        if fields.insert(key.to_owned(), value).is_some() {
            return Err(ProtocolError::DuplicateKey {
                key: key.to_owned(),
            });
        }
    }
    Ok(fields)
}

fn take(fields: &mut BTreeMap<String, String>, key: &str) -> Result<String, ProtocolError> {
    fields.remove(key).ok_or_else(|| ProtocolError::MissingKey {
        key: key.to_owned(),
    })
}

fn take_number(fields: &mut BTreeMap<String, String>, key: &str) -> Result<u64, ProtocolError> {
    let raw = take(fields, key)?;
    raw.parse().map_err(|_| ProtocolError::InvalidNumber {
        key: key.to_owned(),
        value: raw,
    })
}
