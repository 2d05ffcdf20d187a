//! Configuration loading via `ortho-config`.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::credentials::Credentials;
use crate::pipeline::{PipelineSettings, PublishTarget};
use crate::platform::{LogConfig, NasConfig, NasMountPoint, VpcConfig};
use crate::quickstart::QuickstartTarget;
use crate::route::TransferRoute;
use crate::stage::RuntimeProfile;
use crate::transfer::DEFAULT_CHUNK_SIZE;

/// Default directory the instrumented runtime shares its data through.
pub const DEFAULT_REMOTE_PATH: &str = "/tmp/runtime.data.share";

/// Default wrapper script that enables the cache at startup.
pub const DEFAULT_QUICKSTART_WRAPPER: &str = "/code/quickstart.sh";

/// Default user and group identifiers for network share access.
pub const DEFAULT_NAS_ID: i64 = 10003;

/// Pipeline configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PREWARM",
    discovery(
        app_name = "prewarm",
        env_var = "PREWARM_CONFIG_PATH",
        config_file_name = "prewarm.toml",
        dotfile_name = ".prewarm.toml",
        project_file_name = "prewarm.toml"
    )
)]
pub struct PipelineConfig {
    /// Platform region, for example `cn-hangzhou`. Required.
    pub region: String,
    /// Explicit platform endpoint overriding the account/region default.
    pub fc_endpoint: Option<String>,
    /// Account identifier. When the account and both keys are set they take
    /// precedence over the credential store.
    pub account_id: Option<String>,
    /// Access key identifier.
    pub access_key_id: Option<String>,
    /// Access key secret.
    pub access_key_secret: Option<String>,
    /// Credential store profile to use.
    pub profile: Option<String>,
    /// Runtime identifier for the helper function.
    #[ortho_config(default = "python3".to_owned())]
    pub runtime: String,
    /// Helper entry point; defaults per runtime.
    pub handler: Option<String>,
    /// Helper initializer entry point.
    pub initializer: Option<String>,
    /// Helper memory in MiB.
    #[ortho_config(default = 1024)]
    pub memory_mb: u32,
    /// Helper invocation timeout in seconds.
    #[ortho_config(default = 300)]
    pub timeout_secs: u32,
    /// Helper initializer timeout in seconds.
    #[ortho_config(default = 300)]
    pub init_timeout_secs: u32,
    /// Helper instance class.
    #[ortho_config(default = "c1".to_owned())]
    pub instance_type: String,
    /// How the archive travels: `direct`, `object-storage`, or
    /// `network-share`.
    #[ortho_config(default = "direct".to_owned())]
    pub route: String,
    /// Directory the instrumented runtime writes its shared data into.
    #[ortho_config(default = DEFAULT_REMOTE_PATH.to_owned())]
    pub remote_path: String,
    /// Name of the extracted cache directory under the artefact directory.
    #[ortho_config(default = "runtime.data.share".to_owned())]
    pub shared_dir_name: String,
    /// Project root holding the user's code.
    #[ortho_config(default = ".".to_owned())]
    pub project_dir: String,
    /// Output directory for the deployable artefact.
    #[ortho_config(default = "target/artifact".to_owned())]
    pub artifact_dir: String,
    /// Directory holding helper sources injected into the project.
    pub helper_dir: Option<String>,
    /// Role the helper service assumes.
    pub role: Option<String>,
    /// Log project for the helper service.
    pub log_project: Option<String>,
    /// Log store for the helper service.
    pub log_store: Option<String>,
    /// VPC to attach the helper service to.
    pub vpc_id: Option<String>,
    /// Switch inside the VPC.
    pub vswitch_id: Option<String>,
    /// Security group inside the VPC.
    pub security_group_id: Option<String>,
    /// Network share address including its export path.
    pub nas_server_addr: Option<String>,
    /// Mount directory for the network share inside the function.
    pub nas_mount_dir: Option<String>,
    /// User the function accesses the share as.
    pub nas_user_id: Option<i64>,
    /// Group the function accesses the share as.
    pub nas_group_id: Option<i64>,
    /// Object storage endpoint used by the helper function.
    pub oss_endpoint: Option<String>,
    /// Object storage endpoint used from this machine.
    pub local_oss_endpoint: Option<String>,
    /// Download location of the `ossutil` binary bundled into the helper.
    pub ossutil_url: Option<String>,
    /// Local `ossutil` binary.
    #[ortho_config(default = "ossutil64".to_owned())]
    pub ossutil_bin: String,
    /// Local Serverless Devs binary.
    #[ortho_config(default = "s".to_owned())]
    pub s_bin: String,
    /// Bucket receiving the published artefact archive.
    pub publish_bucket: Option<String>,
    /// Object key of the published artefact archive.
    pub publish_key: Option<String>,
    /// Local path receiving the published artefact archive.
    #[ortho_config(cli_short = 'z')]
    pub publish_archive: Option<String>,
    /// Production service updated by `prewarm enable`.
    pub target_service: Option<String>,
    /// Production function updated by `prewarm enable`.
    pub target_function: Option<String>,
    /// Wrapper script that loads the cache at startup.
    #[ortho_config(default = DEFAULT_QUICKSTART_WRAPPER.to_owned())]
    pub quickstart_wrapper: String,
    /// Range length for direct transfers, in bytes.
    #[ortho_config(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size_bytes: u64,
    /// Environment overlay, as `KEY=VALUE` pairs separated by commas.
    #[ortho_config(cli_short = 'x')]
    pub function_env: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to prewarm.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|text| text.trim()).filter(|text| !text.is_empty())
}

impl PipelineConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_present<'a>(
        value: Option<&'a String>,
        metadata: &FieldMetadata,
    ) -> Result<&'a str, ConfigError> {
        present(value).ok_or_else(|| metadata.missing())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: set {} or {} in prewarm.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("prewarm")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty, a number is
    /// zero, or the route and its prerequisites disagree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.region,
            &FieldMetadata::new("platform region", "PREWARM_REGION", "region"),
        )?;
        Self::require_field(
            &self.runtime,
            &FieldMetadata::new("runtime identifier", "PREWARM_RUNTIME", "runtime"),
        )?;
        Self::require_positive(
            u64::from(self.memory_mb),
            &FieldMetadata::new("memory_mb", "PREWARM_MEMORY_MB", "memory_mb"),
        )?;
        Self::require_positive(
            u64::from(self.timeout_secs),
            &FieldMetadata::new("timeout_secs", "PREWARM_TIMEOUT_SECS", "timeout_secs"),
        )?;
        Self::require_positive(
            u64::from(self.init_timeout_secs),
            &FieldMetadata::new(
                "init_timeout_secs",
                "PREWARM_INIT_TIMEOUT_SECS",
                "init_timeout_secs",
            ),
        )?;
        Self::require_positive(
            self.chunk_size_bytes,
            &FieldMetadata::new(
                "chunk_size_bytes",
                "PREWARM_CHUNK_SIZE_BYTES",
                "chunk_size_bytes",
            ),
        )?;

        if self.route()? == TransferRoute::NetworkShare {
            Self::require_present(
                self.nas_server_addr.as_ref(),
                &FieldMetadata::new(
                    "network share address",
                    "PREWARM_NAS_SERVER_ADDR",
                    "nas_server_addr",
                ),
            )?;
            Self::require_present(
                self.nas_mount_dir.as_ref(),
                &FieldMetadata::new(
                    "network share mount directory",
                    "PREWARM_NAS_MOUNT_DIR",
                    "nas_mount_dir",
                ),
            )?;
        }

        if present(self.publish_bucket.as_ref()).is_some() {
            Self::require_present(
                self.publish_key.as_ref(),
                &FieldMetadata::new("publish object key", "PREWARM_PUBLISH_KEY", "publish_key"),
            )?;
        }

        self.function_environment()?;
        RuntimeProfile::from_runtime(&self.runtime)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(())
    }

    /// Parses the configured transfer route.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown route names.
    pub fn route(&self) -> Result<TransferRoute, ConfigError> {
        self.route
            .parse()
            .map_err(|err: crate::route::RouteError| ConfigError::Invalid(err.to_string()))
    }

    /// Parses the `KEY=VALUE,KEY=VALUE` environment overlay.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a pair lacks `=` or has an
    /// empty key.
    pub fn function_environment(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let Some(raw) = present(self.function_env.as_ref()) else {
            return Ok(BTreeMap::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "function_env entry {pair:?} must look like KEY=VALUE"
                    ))
                })?;
                let trimmed_key = key.trim();
                if trimmed_key.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "function_env entry {pair:?} has an empty key"
                    )));
                }
                Ok((trimmed_key.to_owned(), value.trim().to_owned()))
            })
            .collect()
    }

    /// Returns credentials supplied directly through configuration, when all
    /// three parts are present.
    #[must_use]
    pub fn explicit_credentials(&self) -> Option<Credentials> {
        Some(Credentials::new(
            present(self.account_id.as_ref())?,
            present(self.access_key_id.as_ref())?,
            present(self.access_key_secret.as_ref())?,
        ))
    }

    /// Object storage endpoint the helper function uploads to.
    #[must_use]
    pub fn helper_oss_endpoint(&self) -> String {
        present(self.oss_endpoint.as_ref()).map_or_else(
            || format!("oss-{}-internal.aliyuncs.com", self.region.trim()),
            str::to_owned,
        )
    }

    /// Object storage endpoint used from this machine.
    #[must_use]
    pub fn local_oss_endpoint(&self) -> String {
        present(self.local_oss_endpoint.as_ref()).map_or_else(
            || format!("oss-{}.aliyuncs.com", self.region.trim()),
            str::to_owned,
        )
    }

    fn log_config(&self) -> Option<LogConfig> {
        Some(LogConfig {
            project: present(self.log_project.as_ref())?.to_owned(),
            logstore: present(self.log_store.as_ref())?.to_owned(),
        })
    }

    fn vpc_config(&self) -> Option<VpcConfig> {
        Some(VpcConfig {
            vpc_id: present(self.vpc_id.as_ref())?.to_owned(),
            vswitch_ids: vec![present(self.vswitch_id.as_ref())?.to_owned()],
            security_group_id: present(self.security_group_id.as_ref())?.to_owned(),
        })
    }

    fn nas_config(&self) -> Option<NasConfig> {
        Some(NasConfig {
            user_id: self.nas_user_id.unwrap_or(DEFAULT_NAS_ID),
            group_id: self.nas_group_id.unwrap_or(DEFAULT_NAS_ID),
            mount_points: vec![NasMountPoint {
                server_addr: present(self.nas_server_addr.as_ref())?.to_owned(),
                mount_dir: present(self.nas_mount_dir.as_ref())?.to_owned(),
            }],
        })
    }

    fn publish_target(&self) -> Option<PublishTarget> {
        if let (Some(bucket), Some(key)) = (
            present(self.publish_bucket.as_ref()),
            present(self.publish_key.as_ref()),
        ) {
            return Some(PublishTarget::Bucket {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }
        present(self.publish_archive.as_ref()).map(|path| PublishTarget::Archive(path.into()))
    }

    /// Resolves the helper sources `prewarm gen` deploys alongside the
    /// user's code.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `helper_dir` is not set and
    /// [`ConfigError::Invalid`] when it does not name a directory.
    pub fn helper_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        let dir = Self::require_present(
            self.helper_dir.as_ref(),
            &FieldMetadata::new("helper source directory", "PREWARM_HELPER_DIR", "helper_dir"),
        )?;
        let path = Utf8PathBuf::from(dir);
        if !path.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "helper_dir {path} is not a directory: set PREWARM_HELPER_DIR or helper_dir in prewarm.toml"
            )));
        }
        Ok(path)
    }

    /// Resolves the production function `prewarm enable` updates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the target service or
    /// function is not set.
    pub fn quickstart_target(&self) -> Result<QuickstartTarget, ConfigError> {
        let service = Self::require_present(
            self.target_service.as_ref(),
            &FieldMetadata::new(
                "production service",
                "PREWARM_TARGET_SERVICE",
                "target_service",
            ),
        )?;
        let function = Self::require_present(
            self.target_function.as_ref(),
            &FieldMetadata::new(
                "production function",
                "PREWARM_TARGET_FUNCTION",
                "target_function",
            ),
        )?;
        Ok(QuickstartTarget {
            service: service.to_owned(),
            function: function.to_owned(),
            wrapper: self.quickstart_wrapper.trim().to_owned(),
            remote_path: self.remote_path.trim().to_owned(),
        })
    }

    /// Validates the configuration and resolves it into the typed view the
    /// pipeline consumes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn pipeline_settings(
        &self,
        credentials: Credentials,
    ) -> Result<PipelineSettings, ConfigError> {
        self.validate()?;
        let profile = RuntimeProfile::from_runtime(&self.runtime)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let project_dir = Utf8PathBuf::from(self.project_dir.trim());
        let artifact_dir = project_dir.join(self.artifact_dir.trim());
        let temp_root = Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|path| {
            ConfigError::Invalid(format!(
                "temporary directory is not valid UTF-8: {}",
                path.display()
            ))
        })?;

        Ok(PipelineSettings {
            handler: present(self.handler.as_ref())
                .map_or_else(|| profile.default_handler().to_owned(), str::to_owned),
            profile,
            route: self.route()?,
            initializer: present(self.initializer.as_ref()).map(str::to_owned),
            memory_mb: self.memory_mb,
            timeout_secs: self.timeout_secs,
            init_timeout_secs: self.init_timeout_secs,
            instance_type: self.instance_type.trim().to_owned(),
            remote_path: self.remote_path.trim().to_owned(),
            shared_dir_name: self.shared_dir_name.trim().to_owned(),
            quickstart_wrapper: self.quickstart_wrapper.trim().to_owned(),
            project_dir,
            artifact_dir,
            temp_root,
            role: present(self.role.as_ref()).map(str::to_owned),
            log: self.log_config(),
            vpc: self.vpc_config(),
            nas: self.nas_config(),
            environment: self.function_environment()?,
            chunk_size: self.chunk_size_bytes,
            helper_oss_endpoint: self.helper_oss_endpoint(),
            credentials,
            publish: self.publish_target(),
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
