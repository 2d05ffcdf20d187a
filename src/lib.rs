//! Core library for the `prewarm` cache generator.
//!
//! A run deploys a throwaway helper function that wraps the user's code,
//! asks it to dump a startup-acceleration cache, brings the resulting archive
//! back through one of three transfer routes, and then deletes every remote
//! resource it created. The [`pipeline`] module drives the flow; the other
//! modules supply the collaborators it is generic over.

pub mod archive;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod credentials;
pub mod fc;
pub mod ledger;
pub mod pipeline;
pub mod platform;
pub mod protocol;
pub mod quickstart;
pub mod route;
pub mod share;
pub mod stage;
pub mod storage;
pub mod test_support;
pub mod transfer;

pub use config::{ConfigError, PipelineConfig};
pub use fc::{FcClient, FcError, FcSettings};
pub use pipeline::{
    Pipeline, PipelineError, PipelineFailure, PipelineOutcome, PipelineSettings, PipelineStage,
    RunContext,
};
pub use platform::ComputePlatform;
pub use route::TransferRoute;
