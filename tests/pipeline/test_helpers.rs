//! Shared fixtures for pipeline BDD scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use prewarm::credentials::Credentials;
use prewarm::platform::{NasConfig, NasMountPoint};
use prewarm::stage::RuntimeProfile;
use prewarm::test_support::{
    FixtureStager, MemoryStorage, RecordingPlatform, RecordingShare, gzip_tarball,
};
use prewarm::{PipelineError, PipelineSettings, PipelineStage, TransferRoute};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub root: Utf8PathBuf,
    pub platform: RecordingPlatform,
    pub storage: MemoryStorage,
    pub share: RecordingShare,
    pub stager: FixtureStager,
    pub nas: Option<NasConfig>,
    pub outcome: Option<RunResult>,
    _sandbox: Arc<TempDir>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Staging,
    Packaging,
    Deployment,
    Generation,
    Transfer,
    Extraction,
    Publish,
    Cleanup,
}

#[derive(Clone, Debug)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub reached: PipelineStage,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum RunResult {
    Success {
        shared_dir: Utf8PathBuf,
        bucket: String,
    },
    Failure {
        failure: RunFailure,
        bucket: String,
    },
}

impl RunResult {
    pub fn bucket(&self) -> &str {
        match self {
            Self::Success { bucket, .. } | Self::Failure { bucket, .. } => bucket,
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum PipelineTestError {
    #[error("invalid pipeline fixture: {0}")]
    Fixture(String),
}

#[fixture]
pub fn pipeline_context() -> PipelineContext {
    build_pipeline_context()
        .unwrap_or_else(|err| panic!("pipeline context fixture should initialise: {err}"))
}

fn build_pipeline_context() -> Result<PipelineContext, PipelineTestError> {
    let sandbox =
        TempDir::new().map_err(|err| PipelineTestError::Fixture(format!("temp dir: {err}")))?;
    let root = Utf8PathBuf::from_path_buf(sandbox.path().to_path_buf()).map_err(|path| {
        PipelineTestError::Fixture(format!("non-UTF-8 temp dir: {}", path.display()))
    })?;
    let storage = MemoryStorage::new();
    let share = RecordingShare::new();
    let platform = RecordingPlatform::new()
        .with_storage(storage.clone())
        .with_share(share.clone());

    Ok(PipelineContext {
        root,
        platform,
        storage,
        share,
        stager: FixtureStager::new(),
        nas: None,
        outcome: None,
        _sandbox: Arc::new(sandbox),
    })
}

pub fn cache_tarball() -> Result<Vec<u8>, PipelineTestError> {
    gzip_tarball(&[
        ("cache/classes.jsa", b"shared archive".as_slice()),
        ("cache/nested/index.bin", b"index".as_slice()),
    ])
    .map_err(|err| PipelineTestError::Fixture(format!("tarball: {err}")))
}

pub fn network_share() -> NasConfig {
    NasConfig {
        user_id: 10003,
        group_id: 10003,
        mount_points: vec![NasMountPoint {
            server_addr: String::from("nas.example.com:/share"),
            mount_dir: String::from("/mnt/auto"),
        }],
    }
}

pub fn settings(
    context: &PipelineContext,
    route: TransferRoute,
) -> Result<PipelineSettings, PipelineTestError> {
    let profile = RuntimeProfile::from_runtime("python3")
        .map_err(|err| PipelineTestError::Fixture(err.to_string()))?;
    let project_dir = context.root.join("project");
    Ok(PipelineSettings {
        handler: String::from(profile.default_handler()),
        profile,
        initializer: None,
        route,
        memory_mb: 1024,
        timeout_secs: 300,
        init_timeout_secs: 300,
        instance_type: String::from("c1"),
        remote_path: String::from("/tmp/runtime.data.share"),
        shared_dir_name: String::from("runtime.data.share"),
        quickstart_wrapper: String::from("/code/quickstart.sh"),
        artifact_dir: project_dir.join("target/artifact"),
        project_dir,
        temp_root: context.root.join("tmp"),
        role: None,
        log: None,
        vpc: None,
        nas: context.nas.clone(),
        environment: BTreeMap::new(),
        chunk_size: 16,
        helper_oss_endpoint: String::from("oss-cn-hangzhou-internal.aliyuncs.com"),
        credentials: Credentials::new("1234", "ak", "sk"),
        publish: None,
    })
}

pub const fn failure_kind(error: &PipelineError) -> FailureKind {
    match error {
        PipelineError::Staging(_) => FailureKind::Staging,
        PipelineError::Packaging(_) => FailureKind::Packaging,
        PipelineError::Deployment { .. } => FailureKind::Deployment,
        PipelineError::Generation { .. } => FailureKind::Generation,
        PipelineError::Transfer(_) => FailureKind::Transfer,
        PipelineError::Extraction(_) => FailureKind::Extraction,
        PipelineError::Publish { .. } => FailureKind::Publish,
        PipelineError::Cleanup { .. } => FailureKind::Cleanup,
    }
}

pub fn parse_failure_kind(kind: &str) -> Option<FailureKind> {
    match kind {
        "staging" => Some(FailureKind::Staging),
        "packaging" => Some(FailureKind::Packaging),
        "deployment" => Some(FailureKind::Deployment),
        "generation" => Some(FailureKind::Generation),
        "transfer" => Some(FailureKind::Transfer),
        "extraction" => Some(FailureKind::Extraction),
        "publish" => Some(FailureKind::Publish),
        "cleanup" => Some(FailureKind::Cleanup),
        _ => None,
    }
}
