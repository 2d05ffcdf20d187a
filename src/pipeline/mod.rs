//! Pipeline controller.
//!
//! A [`Pipeline`] stages the helper workspace, packages it, deploys a
//! throwaway service, function, and HTTP trigger, asks the helper to dump the
//! acceleration cache, retrieves and extracts it, and publishes the user's
//! artefact. Every remote and local resource it creates is recorded in a
//! [`ResourceLedger`], and the ledger is swept by the [`Janitor`] whether or
//! not the main flow succeeded.

use std::collections::BTreeMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::{ArchiveError, ArchivePackager, extract_tarball, sibling_archive_path};
use crate::cleanup::{CleanupReport, Janitor};
use crate::credentials::Credentials;
use crate::ledger::ResourceLedger;
use crate::platform::{
    ComputePlatform, FunctionCode, FunctionSpec, LogConfig, NasConfig, ServiceSpec, TriggerSpec,
    VpcConfig,
};
use crate::protocol::{ARCHIVE_NAME, DumpRequest, HelperCommand, StorageUpload, is_success};
use crate::route::{Retrieval, TransferRoute};
use crate::share::NetworkShare;
use crate::stage::{ArtifactStager, RuntimeProfile, StagingError};
use crate::storage::ObjectStorage;
use crate::transfer::TransferError;

/// Prefix of the helper service name.
pub const SERVICE_PREFIX: &str = "trace-dump-service-";
/// Prefix of the helper function name.
pub const FUNCTION_PREFIX: &str = "trace-dump-func-";
/// Prefix of the helper trigger name.
pub const TRIGGER_PREFIX: &str = "trace-dump-trigger-";
/// Prefix of the transient bucket name.
pub const BUCKET_PREFIX: &str = "tmp-acceleration-";
/// Prefix of the local workspace directory name.
pub const WORKSPACE_PREFIX: &str = "trace-dump-tmp-";

const SERVICE_DESCRIPTION: &str = "Temporary service generating a startup acceleration cache";

/// Where the finished artefact goes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublishTarget {
    /// Package the artefact directory and upload it to object storage.
    Bucket {
        /// Destination bucket.
        bucket: String,
        /// Destination object key.
        key: String,
    },
    /// Package the artefact directory into a local zip.
    Archive(Utf8PathBuf),
}

/// Resolved, immutable pipeline inputs.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Runtime family and its layout rules.
    pub profile: RuntimeProfile,
    /// Helper entry point.
    pub handler: String,
    /// Helper initializer entry point.
    pub initializer: Option<String>,
    /// Transfer route for code and archive.
    pub route: TransferRoute,
    /// Helper memory in MiB.
    pub memory_mb: u32,
    /// Helper invocation timeout in seconds.
    pub timeout_secs: u32,
    /// Helper initializer timeout in seconds.
    pub init_timeout_secs: u32,
    /// Helper instance class.
    pub instance_type: String,
    /// Directory the instrumented runtime shares its data through.
    pub remote_path: String,
    /// Name of the extracted cache directory.
    pub shared_dir_name: String,
    /// Wrapper script that loads the cache at startup.
    pub quickstart_wrapper: String,
    /// Project root.
    pub project_dir: Utf8PathBuf,
    /// Output directory for the deployable artefact.
    pub artifact_dir: Utf8PathBuf,
    /// Parent directory of the per-run workspace.
    pub temp_root: Utf8PathBuf,
    /// Role the helper service assumes.
    pub role: Option<String>,
    /// Log destination of the helper service.
    pub log: Option<LogConfig>,
    /// Private network of the helper service.
    pub vpc: Option<VpcConfig>,
    /// Network share mounts of the helper service.
    pub nas: Option<NasConfig>,
    /// Environment overlay applied to the helper function.
    pub environment: BTreeMap<String, String>,
    /// Range length for direct transfers.
    pub chunk_size: u64,
    /// Object storage endpoint reachable from the helper.
    pub helper_oss_endpoint: String,
    /// Keys handed to the helper for object storage uploads.
    pub credentials: Credentials,
    /// Destination of the finished artefact.
    pub publish: Option<PublishTarget>,
}

impl PipelineSettings {
    fn nas_mount_dir(&self) -> Option<&str> {
        self.nas
            .as_ref()
            .and_then(|nas| nas.mount_points.first())
            .map(|mount| mount.mount_dir.as_str())
    }
}

/// Names and paths minted for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunContext {
    /// Helper service name.
    pub service: String,
    /// Helper function name.
    pub function: String,
    /// Helper trigger name.
    pub trigger: String,
    /// Transient bucket name.
    pub bucket: String,
    /// Local workspace directory.
    pub workspace: Utf8PathBuf,
    /// Zip built from the workspace.
    pub package: Utf8PathBuf,
    /// Zip built from the artefact directory before upload.
    pub publish_package: Utf8PathBuf,
    /// Directory receiving the extracted cache.
    pub shared_dir: Utf8PathBuf,
    /// Retrieved tarball, deleted after extraction.
    pub local_archive: Utf8PathBuf,
}

impl RunContext {
    /// Mints fresh names from a random identifier and the current time.
    #[must_use]
    pub fn mint(settings: &PipelineSettings) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::with_suffix(settings, &suffix, chrono::Utc::now().timestamp_millis())
    }

    /// Builds the context from an explicit suffix and timestamp.
    #[must_use]
    pub fn with_suffix(settings: &PipelineSettings, suffix: &str, stamp_millis: i64) -> Self {
        let short: String = suffix.chars().take(8).collect();
        let workspace = settings
            .temp_root
            .join(format!("{WORKSPACE_PREFIX}{stamp_millis}-{short}"));
        let package = sibling_archive_path(&workspace);
        let publish_package = settings
            .temp_root
            .join(format!("{WORKSPACE_PREFIX}{stamp_millis}-{short}-artifact.zip"));
        let shared_dir = settings.artifact_dir.join(&settings.shared_dir_name);
        let local_archive = shared_dir.join(ARCHIVE_NAME);
        Self {
            service: format!("{SERVICE_PREFIX}{suffix}"),
            function: format!("{FUNCTION_PREFIX}{suffix}"),
            trigger: format!("{TRIGGER_PREFIX}{suffix}"),
            bucket: format!("{BUCKET_PREFIX}{suffix}"),
            workspace,
            package,
            publish_package,
            shared_dir,
            local_archive,
        }
    }
}

/// Milestones of a run, in order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PipelineStage {
    /// Nothing has happened yet.
    Init,
    /// The workspace is populated.
    Staged,
    /// The workspace zip exists.
    Packaged,
    /// The helper service exists.
    ServiceCreated,
    /// The helper function exists.
    FunctionCreated,
    /// The helper trigger exists.
    TriggerCreated,
    /// The helper reported a successful dump.
    Invoked,
    /// The tarball is on local disk.
    Retrieved,
    /// The cache is unpacked.
    LocalExtracted,
    /// The user's files sit beside the cache.
    UserArtifactCopied,
    /// The artefact was uploaded.
    RemoteUploaded,
    /// The main flow finished.
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Staged => "staged",
            Self::Packaged => "packaged",
            Self::ServiceCreated => "service created",
            Self::FunctionCreated => "function created",
            Self::TriggerCreated => "trigger created",
            Self::Invoked => "invoked",
            Self::Retrieved => "retrieved",
            Self::LocalExtracted => "extracted",
            Self::UserArtifactCopied => "user artefact copied",
            Self::RemoteUploaded => "uploaded",
            Self::Done => "done",
        })
    }
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The workspace could not be populated.
    #[error("staging failed: {0}")]
    Staging(#[source] StagingError),
    /// The workspace zip could not be built.
    #[error("packaging failed: {0}")]
    Packaging(#[source] ArchiveError),
    /// A helper resource could not be created.
    #[error("failed to create {resource}: {message}")]
    Deployment {
        /// Resource being created.
        resource: String,
        /// Platform error message.
        message: String,
    },
    /// The helper did not report a successful dump.
    #[error("cache generation failed: {message}")]
    Generation {
        /// Response body or invocation error.
        message: String,
    },
    /// The archive could not be moved.
    #[error("transfer failed: {0}")]
    Transfer(#[source] TransferError),
    /// The retrieved archive could not be unpacked.
    #[error("extraction failed: {0}")]
    Extraction(#[source] ArchiveError),
    /// The artefact could not be copied or published.
    #[error("publishing failed: {message}")]
    Publish {
        /// Underlying error message.
        message: String,
    },
    /// The main flow succeeded but cleanup did not.
    #[error("cleanup failed: {summary}")]
    Cleanup {
        /// Every failed resource and its error.
        summary: String,
    },
}

/// A failed run: the error, how far the run got, and what cleanup did.
#[derive(Debug)]
pub struct PipelineFailure {
    /// Last milestone reached before the failure.
    pub reached: PipelineStage,
    /// First error of the run.
    pub error: Box<PipelineError>,
    /// Cleanup outcome.
    pub cleanup: CleanupReport,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.cleanup.is_clean() && !matches!(*self.error, PipelineError::Cleanup { .. }) {
            write!(f, " (cleanup also failed: {})", self.cleanup.failure_summary())?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// A successful run.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Directory holding the extracted cache.
    pub shared_dir: Utf8PathBuf,
    /// Size of the retrieved tarball.
    pub archive_bytes: u64,
    /// Number of user files copied into the artefact directory.
    pub user_files: usize,
    /// Cleanup outcome; always clean for a successful run.
    pub cleanup: CleanupReport,
}

struct FlowOutput {
    archive_bytes: u64,
    user_files: usize,
}

/// Runs the cache generation flow against the given collaborators.
#[derive(Debug)]
pub struct Pipeline<P, S, N, A> {
    settings: PipelineSettings,
    platform: P,
    storage: S,
    share: N,
    stager: A,
}

impl<P, S, N, A> Pipeline<P, S, N, A>
where
    P: ComputePlatform + Sync,
    S: ObjectStorage,
    N: NetworkShare,
    A: ArtifactStager,
{
    /// Creates a pipeline.
    #[must_use]
    pub const fn new(settings: PipelineSettings, platform: P, storage: S, share: N, stager: A) -> Self {
        Self {
            settings,
            platform,
            storage,
            share,
            stager,
        }
    }

    /// Runs with freshly minted names.
    ///
    /// # Errors
    ///
    /// See [`Self::run_with`].
    pub async fn run(&self) -> Result<PipelineOutcome, PipelineFailure> {
        let context = RunContext::mint(&self.settings);
        self.run_with(&context).await
    }

    /// Runs the main flow, then sweeps everything it recorded.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineFailure`] carrying the first main-flow error, or
    /// [`PipelineError::Cleanup`] when only cleanup failed.
    pub async fn run_with(&self, context: &RunContext) -> Result<PipelineOutcome, PipelineFailure> {
        let mut ledger = ResourceLedger::new();
        ledger.record_local_path(context.workspace.clone());
        ledger.record_local_path(context.package.clone());
        let mut reached = PipelineStage::Init;

        tracing::info!(
            service = %context.service,
            function = %context.function,
            route = %self.settings.route,
            runtime = self.settings.profile.runtime(),
            "starting cache generation"
        );
        let result = self.main_flow(context, &mut ledger, &mut reached).await;
        if let Err(err) = &result {
            tracing::error!(stage = %reached, error = %err, "cache generation failed");
        }

        tracing::info!(resources = ledger.entries().len(), "cleaning up");
        let cleanup = Janitor::new(&self.platform, &self.storage)
            .sweep(&ledger)
            .await;

        match result {
            Ok(output) if cleanup.is_clean() => {
                tracing::info!(shared_dir = %context.shared_dir, "cache generation finished");
                Ok(PipelineOutcome {
                    shared_dir: context.shared_dir.clone(),
                    archive_bytes: output.archive_bytes,
                    user_files: output.user_files,
                    cleanup,
                })
            }
            Ok(_) => Err(PipelineFailure {
                reached,
                error: Box::new(PipelineError::Cleanup {
                    summary: cleanup.failure_summary(),
                }),
                cleanup,
            }),
            Err(error) => Err(PipelineFailure {
                reached,
                error: Box::new(error),
                cleanup,
            }),
        }
    }

    async fn main_flow(
        &self,
        context: &RunContext,
        ledger: &mut ResourceLedger,
        reached: &mut PipelineStage,
    ) -> Result<FlowOutput, PipelineError> {
        let settings = &self.settings;
        let route = settings.route;
        let remote_file =
            route
                .archive_location(settings.nas_mount_dir())
                .ok_or_else(|| PipelineError::Deployment {
                    resource: String::from("network share mount"),
                    message: String::from("no mount directory configured"),
                })?;

        let staged = self
            .stager
            .stage(&context.workspace, ledger)
            .await
            .map_err(PipelineError::Staging)?;
        advance(reached, PipelineStage::Staged);
        tracing::info!(workspace = %staged.root, files = staged.files, "workspace staged");

        let summary = ArchivePackager::default()
            .package(&staged.root, &context.package)
            .map_err(PipelineError::Packaging)?;
        advance(reached, PipelineStage::Packaged);
        tracing::info!(
            package = %context.package,
            files = summary.files,
            directories = summary.directories,
            symlinks = summary.symlinks,
            "workspace packaged"
        );

        let code = route
            .provision_code(&self.storage, &context.bucket, &context.package, ledger)
            .map_err(PipelineError::Transfer)?;

        self.deploy(context, code, ledger, reached).await?;

        route
            .prepare(&self.share, &settings.remote_path, &remote_file)
            .map_err(PipelineError::Transfer)?;
        self.generate(context, &remote_file).await?;
        advance(reached, PipelineStage::Invoked);

        let archive_bytes = self.retrieve(context, &remote_file, ledger).await?;
        advance(reached, PipelineStage::Retrieved);

        extract_tarball(&context.local_archive, &context.shared_dir)
            .map_err(PipelineError::Extraction)?;
        remove_file(&context.local_archive)
            .await
            .map_err(PipelineError::Extraction)?;
        ledger.discharge_local_path(&context.local_archive);
        advance(reached, PipelineStage::LocalExtracted);

        let user_files = self
            .stager
            .copy_user_artifact(&settings.artifact_dir)
            .await
            .map_err(|err| PipelineError::Publish {
                message: err.to_string(),
            })?;
        advance(reached, PipelineStage::UserArtifactCopied);
        tracing::info!(artifact_dir = %settings.artifact_dir, files = user_files, "user artefact copied");

        if self.publish(context, ledger)? {
            advance(reached, PipelineStage::RemoteUploaded);
        }
        advance(reached, PipelineStage::Done);
        Ok(FlowOutput {
            archive_bytes,
            user_files,
        })
    }

    async fn deploy(
        &self,
        context: &RunContext,
        code: FunctionCode,
        ledger: &mut ResourceLedger,
        reached: &mut PipelineStage,
    ) -> Result<(), PipelineError> {
        let settings = &self.settings;
        let service = ServiceSpec {
            name: context.service.clone(),
            description: String::from(SERVICE_DESCRIPTION),
            role: settings.role.clone(),
            log: settings.log.clone(),
            vpc: settings.vpc.clone(),
            nas: settings.nas.clone(),
        };
        self.platform
            .create_service(&service)
            .await
            .map_err(|err| deployment_error(format!("service {}", context.service), &err))?;
        ledger.record_service(&context.service);
        advance(reached, PipelineStage::ServiceCreated);
        tracing::info!(service = %context.service, "service created");

        let mut environment = settings.environment.clone();
        environment.extend(
            settings
                .profile
                .function_environment(&settings.remote_path, &settings.quickstart_wrapper),
        );
        let function = FunctionSpec {
            name: context.function.clone(),
            handler: settings.handler.clone(),
            runtime: settings.profile.runtime().to_owned(),
            memory_mb: settings.memory_mb,
            timeout_secs: settings.timeout_secs,
            initializer: settings.initializer.clone(),
            initialization_timeout_secs: settings.init_timeout_secs,
            instance_type: settings.instance_type.clone(),
            environment,
            code,
        };
        self.platform
            .create_function(&context.service, &function)
            .await
            .map_err(|err| {
                deployment_error(format!("function {}/{}", context.service, context.function), &err)
            })?;
        ledger.record_function(&context.function);
        advance(reached, PipelineStage::FunctionCreated);
        tracing::info!(service = %context.service, function = %context.function, "function created");

        let trigger = TriggerSpec::http(&context.trigger);
        self.platform
            .create_trigger(&context.service, &context.function, &trigger)
            .await
            .map_err(|err| deployment_error(format!("trigger {}", context.trigger), &err))?;
        ledger.record_trigger(&context.function, &context.trigger);
        advance(reached, PipelineStage::TriggerCreated);
        tracing::info!(trigger = %context.trigger, "trigger created");
        Ok(())
    }

    async fn generate(&self, context: &RunContext, remote_file: &str) -> Result<(), PipelineError> {
        let settings = &self.settings;
        let storage = settings.route.uploads_to_storage().then(|| StorageUpload {
            access_key_id: settings.credentials.access_key_id.clone(),
            access_key_secret: settings.credentials.access_key_secret.clone(),
            endpoint: settings.helper_oss_endpoint.clone(),
            bucket: context.bucket.clone(),
        });
        let command = HelperCommand::Dump(DumpRequest {
            shared_path: settings.remote_path.clone(),
            archive_file: remote_file.to_owned(),
            method: settings.profile.dump_method().map(str::to_owned),
            storage,
        });

        tracing::info!(function = %context.function, archive = remote_file, "requesting cache dump");
        let response = self
            .platform
            .invoke(
                &context.service,
                &context.function,
                command.path(),
                command.encode(),
            )
            .await
            .map_err(|err| PipelineError::Generation {
                message: err.to_string(),
            })?;
        if !is_success(&response) {
            return Err(PipelineError::Generation {
                message: response.trim().to_owned(),
            });
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        context: &RunContext,
        remote_file: &str,
        ledger: &mut ResourceLedger,
    ) -> Result<u64, PipelineError> {
        reset_dir(&context.shared_dir)
            .await
            .map_err(PipelineError::Transfer)?;
        ledger.record_local_path(context.local_archive.clone());
        let retrieval = Retrieval {
            platform: &self.platform,
            storage: &self.storage,
            share: &self.share,
            service: &context.service,
            function: &context.function,
            bucket: &context.bucket,
            remote_file,
            chunk_size: self.settings.chunk_size,
        };
        let bytes = self
            .settings
            .route
            .retrieve(&retrieval, &context.local_archive, ledger)
            .await
            .map_err(PipelineError::Transfer)?;
        tracing::info!(archive = %context.local_archive, bytes, "archive retrieved");
        Ok(bytes)
    }

    /// Returns `true` when the artefact was uploaded.
    fn publish(&self, context: &RunContext, ledger: &mut ResourceLedger) -> Result<bool, PipelineError> {
        let artifact_dir = &self.settings.artifact_dir;
        let publish_err = |message: String| PipelineError::Publish { message };
        match &self.settings.publish {
            None => Ok(false),
            Some(PublishTarget::Archive(path)) => {
                if let Some(parent) = path.parent().filter(|dir| !dir.as_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|err| publish_err(err.to_string()))?;
                }
                ArchivePackager::default()
                    .package(artifact_dir, path)
                    .map_err(|err| publish_err(err.to_string()))?;
                tracing::info!(archive = %path, "artefact archive written");
                Ok(false)
            }
            Some(PublishTarget::Bucket { bucket, key }) => {
                ledger.record_local_path(context.publish_package.clone());
                ArchivePackager::default()
                    .package(artifact_dir, &context.publish_package)
                    .map_err(|err| publish_err(err.to_string()))?;
                self.storage
                    .put(bucket, key, &context.publish_package)
                    .map_err(|err| publish_err(err.to_string()))?;
                tracing::info!(bucket = %bucket, key = %key, "artefact uploaded");
                Ok(true)
            }
        }
    }
}

fn advance(reached: &mut PipelineStage, stage: PipelineStage) {
    tracing::debug!(from = %reached, to = %stage, "pipeline stage");
    *reached = stage;
}

fn deployment_error(resource: String, err: &dyn std::error::Error) -> PipelineError {
    PipelineError::Deployment {
        resource,
        message: err.to_string(),
    }
}

async fn reset_dir(dir: &Utf8Path) -> Result<(), TransferError> {
    let io_err = |err: std::io::Error| TransferError::Io {
        path: dir.to_string(),
        message: err.to_string(),
    };
    if tokio::fs::try_exists(dir).await.map_err(io_err)? {
        tokio::fs::remove_dir_all(dir).await.map_err(io_err)?;
    }
    tokio::fs::create_dir_all(dir).await.map_err(io_err)
}

async fn remove_file(path: &Utf8Path) -> Result<(), ArchiveError> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|err| ArchiveError::Extract {
            path: path.to_string(),
            message: err.to_string(),
        })
}
