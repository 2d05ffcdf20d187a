//! BDD scenarios for the cache generation pipeline.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PipelineContext, pipeline_context};

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Generate a cache over the direct route"
)]
fn scenario_direct_route(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Report a failed dump and still clean up"
)]
fn scenario_failed_dump(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Remove the staging bucket when function creation fails"
)]
fn scenario_function_creation_failure(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Retrieve the cache through object storage"
)]
fn scenario_object_storage_route(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Retrieve the cache through the network share"
)]
fn scenario_network_share_route(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Surface cleanup failures after a successful run"
)]
fn scenario_cleanup_failure(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}
