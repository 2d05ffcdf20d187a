//! Binary entry point for the `prewarm` CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cli::{Cli, EnableCommand, GenCommand};
use prewarm::command::ProcessCommandRunner;
use prewarm::config::{ConfigError, PipelineConfig};
use prewarm::credentials::{
    CredentialProvider, Credentials, ProfileCredentialStore, StaticCredentials,
};
use prewarm::fc::{FcClient, FcError, FcSettings};
use prewarm::pipeline::{Pipeline, PipelineFailure};
use prewarm::quickstart::{QuickstartError, enable_quickstart};
use prewarm::route::TransferRoute;
use prewarm::share::ServerlessDevsShare;
use prewarm::stage::WorkspaceStager;
use prewarm::storage::{OssUtilSettings, OssUtilStorage, StorageError};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("credential error: {0}")]
    Credentials(String),
    #[error("platform client error: {0}")]
    Platform(#[from] FcError),
    #[error("object storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("cache generation failed: {0}")]
    Pipeline(Box<PipelineFailure>),
    #[error(transparent)]
    Quickstart(#[from] QuickstartError),
}

impl From<PipelineFailure> for CliError {
    fn from(failure: PipelineFailure) -> Self {
        Self::Pipeline(Box::new(failure))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Gen(command) => run_gen(command).await,
        Cli::Enable(command) => run_enable(command).await,
    }
}

fn load_config() -> Result<PipelineConfig, CliError> {
    Ok(PipelineConfig::load_without_cli_args()?)
}

fn apply_gen_overrides(config: &mut PipelineConfig, args: GenCommand) {
    if let Some(route) = args.route {
        config.route = route;
    }
    if let Some(project_dir) = args.project_dir {
        config.project_dir = project_dir;
    }
}

fn apply_enable_overrides(config: &mut PipelineConfig, args: EnableCommand) {
    if let Some(service) = args.service {
        config.target_service = Some(service);
    }
    if let Some(function) = args.function {
        config.target_function = Some(function);
    }
}

fn resolve_credentials(config: &PipelineConfig) -> Result<Credentials, CliError> {
    let profile = config
        .profile
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let credentials = credential_provider(config)?
        .credentials(profile)
        .map_err(|err| CliError::Credentials(err.to_string()))?;
    if credentials.is_incomplete() {
        return Err(CliError::Credentials(String::from(concat!(
            "account id, access key id, and access key secret are required: set ",
            "PREWARM_ACCOUNT_ID, PREWARM_ACCESS_KEY_ID, and PREWARM_ACCESS_KEY_SECRET ",
            "or add a profile to the credential store"
        ))));
    }
    Ok(credentials)
}

fn credential_provider(config: &PipelineConfig) -> Result<Box<dyn CredentialProvider>, CliError> {
    if let Some(explicit) = config.explicit_credentials() {
        return Ok(Box::new(StaticCredentials::new(explicit)));
    }
    let store = ProfileCredentialStore::discover().ok_or_else(|| {
        CliError::Credentials(String::from(
            "no credential store location: set PREWARM_CREDENTIALS_PATH or HOME",
        ))
    })?;
    Ok(Box::new(store))
}

fn fc_settings(config: &PipelineConfig, credentials: Credentials) -> FcSettings {
    FcSettings {
        region: config.region.trim().to_owned(),
        endpoint: config.fc_endpoint.clone(),
        credentials,
        timeout: Duration::from_secs(u64::from(
            config.timeout_secs.max(config.init_timeout_secs),
        )),
    }
}

async fn run_gen(args: GenCommand) -> Result<i32, CliError> {
    let mut config = load_config()?;
    apply_gen_overrides(&mut config, args);
    config.validate()?;
    let helper_dir = config.helper_dir()?;
    let credentials = resolve_credentials(&config)?;
    let settings = config.pipeline_settings(credentials.clone())?;

    let storage = OssUtilStorage::new(
        OssUtilSettings {
            bin: config.ossutil_bin.clone(),
            endpoint: config.local_oss_endpoint(),
            access_key_id: credentials.access_key_id.clone(),
            access_key_secret: credentials.access_key_secret.clone(),
        },
        ProcessCommandRunner,
    )?;
    let platform = FcClient::new(&fc_settings(&config, credentials))?;
    let share = ServerlessDevsShare::new(config.s_bin.clone(), ProcessCommandRunner);
    let ossutil_url = if settings.route == TransferRoute::ObjectStorage {
        config.ossutil_url.clone()
    } else {
        None
    };
    let stager = WorkspaceStager::new(
        settings.profile.clone(),
        settings.project_dir.clone(),
        ProcessCommandRunner,
    )
    .with_helper_dir(Some(helper_dir))
    .with_ossutil_url(ossutil_url);

    let pipeline = Pipeline::new(settings, platform, storage, share, stager);
    let outcome = pipeline.run().await?;
    tracing::info!(
        shared_dir = %outcome.shared_dir,
        archive_bytes = outcome.archive_bytes,
        user_files = outcome.user_files,
        "cache generated"
    );
    Ok(0)
}

async fn run_enable(args: EnableCommand) -> Result<i32, CliError> {
    let mut config = load_config()?;
    apply_enable_overrides(&mut config, args);
    config.validate()?;
    let target = config.quickstart_target()?;
    let overlay = config.function_environment()?;
    let credentials = resolve_credentials(&config)?;
    let platform = FcClient::new(&fc_settings(&config, credentials))?;

    let environment = enable_quickstart(&platform, &target, &overlay).await?;
    tracing::info!(variables = environment.len(), "function environment updated");
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod main_tests;
