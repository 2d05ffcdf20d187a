//! BDD step definitions for the cache generation pipeline.

use prewarm::{Pipeline, RunContext, TransferRoute};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    PipelineContext, PipelineTestError, RunFailure, RunResult, cache_tarball, failure_kind,
    network_share, parse_failure_kind, settings,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] PipelineTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a python project")]
fn python_project(mut pipeline_context: PipelineContext) -> PipelineContext {
    pipeline_context.stager = pipeline_context
        .stager
        .with_file("index.py", "def handler(event, context):\n    return 'ok'\n")
        .with_user_file("index.py", "def handler(event, context):\n    return 'ok'\n");
    pipeline_context
}

#[given("the helper produces a cache archive")]
fn helper_produces_cache(
    mut pipeline_context: PipelineContext,
) -> Result<PipelineContext, StepError> {
    pipeline_context.platform = pipeline_context.platform.with_payload(cache_tarball()?);
    Ok(pipeline_context)
}

#[given("the helper reports \"{response}\"")]
fn helper_reports(mut pipeline_context: PipelineContext, response: String) -> PipelineContext {
    pipeline_context.platform = pipeline_context.platform.with_dump_response(response);
    pipeline_context
}

#[given("function creation fails")]
fn function_creation_fails(mut pipeline_context: PipelineContext) -> PipelineContext {
    pipeline_context.platform = pipeline_context.platform.failing("create_function");
    pipeline_context
}

#[given("trigger deletion fails")]
fn trigger_deletion_fails(mut pipeline_context: PipelineContext) -> PipelineContext {
    pipeline_context.platform = pipeline_context.platform.failing("delete_trigger");
    pipeline_context
}

#[given("a network share is mounted")]
fn network_share_mounted(mut pipeline_context: PipelineContext) -> PipelineContext {
    pipeline_context.nas = Some(network_share());
    pipeline_context
}

#[when("I run the pipeline over the \"{route}\" route")]
fn run_pipeline(
    mut pipeline_context: PipelineContext,
    route: String,
) -> Result<PipelineContext, StepError> {
    let parsed: TransferRoute = route
        .parse()
        .map_err(|err| StepError::Assertion(format!("{err}")))?;
    let settings = settings(&pipeline_context, parsed)?;
    let run_context = RunContext::mint(&settings);
    let pipeline = Pipeline::new(
        settings,
        pipeline_context.platform.clone(),
        pipeline_context.storage.clone(),
        pipeline_context.share.clone(),
        pipeline_context.stager.clone(),
    );

    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let result = runtime.block_on(pipeline.run_with(&run_context));
    let bucket = run_context.bucket.clone();
    pipeline_context.outcome = Some(match result {
        Ok(_) => RunResult::Success {
            shared_dir: run_context.shared_dir,
            bucket,
        },
        Err(failure) => RunResult::Failure {
            failure: RunFailure {
                kind: failure_kind(&failure.error),
                reached: failure.reached,
                message: failure.to_string(),
            },
            bucket,
        },
    });
    Ok(pipeline_context)
}

#[then("the run succeeds")]
fn run_succeeds(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    match &pipeline_context.outcome {
        Some(RunResult::Success { .. }) => Ok(()),
        Some(RunResult::Failure { failure, .. }) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the run fails at stage \"{stage}\" with a \"{kind}\" error")]
fn run_fails(
    pipeline_context: &PipelineContext,
    stage: String,
    kind: String,
) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)
        .ok_or_else(|| StepError::Assertion(format!("unknown failure kind: {kind}")))?;
    let Some(RunResult::Failure { failure, .. }) = &pipeline_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind != expected {
        return Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )));
    }
    if failure.reached.to_string() != stage {
        return Err(StepError::Assertion(format!(
            "expected stage {stage}, reached {}",
            failure.reached
        )));
    }
    Ok(())
}

#[then("the error message mentions \"{text}\"")]
fn error_mentions(pipeline_context: &PipelineContext, text: String) -> Result<(), StepError> {
    let Some(RunResult::Failure { failure, .. }) = &pipeline_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.message.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {text:?} in {:?}",
            failure.message
        )))
    }
}

#[then("the extracted cache is present")]
fn cache_present(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let Some(RunResult::Success { shared_dir, .. }) = &pipeline_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected success outcome",
        )));
    };
    for relative in ["cache/classes.jsa", "cache/nested/index.bin"] {
        if !shared_dir.join(relative).is_file() {
            return Err(StepError::Assertion(format!(
                "{relative} missing under {shared_dir}"
            )));
        }
    }
    if shared_dir.join("srctl.tar.gz").exists() {
        return Err(StepError::Assertion(String::from(
            "tarball should be removed after extraction",
        )));
    }
    Ok(())
}

#[then("no remote resources remain")]
fn nothing_remains(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let live = pipeline_context.platform.live_resources();
    if live.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("resources left behind: {live:?}")))
    }
}

#[then("the staging bucket is removed")]
fn bucket_removed(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let bucket = pipeline_context
        .outcome
        .as_ref()
        .map(RunResult::bucket)
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))?;
    let calls = pipeline_context.storage.calls();
    if !calls.contains(&format!("delete_bucket {bucket}")) {
        return Err(StepError::Assertion(format!(
            "bucket {bucket} was never deleted: {calls:?}"
        )));
    }
    let buckets = pipeline_context.storage.buckets();
    if buckets.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("buckets left behind: {buckets:?}")))
    }
}
