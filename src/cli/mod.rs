//! Command-line interface definitions for the `prewarm` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `prewarm` binary.
#[derive(Debug, Parser)]
#[command(
    name = "prewarm",
    about = "Generate a startup-acceleration cache on a throwaway cloud function",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Deploy the helper, generate the cache, retrieve it, and clean up.
    #[command(
        name = "gen",
        about = "Deploy a temporary helper, generate the cache, and clean up"
    )]
    Gen(GenCommand),
    /// Point the production function at the generated cache.
    #[command(
        name = "enable",
        about = "Enable the generated cache on the production function"
    )]
    Enable(EnableCommand),
}

/// Arguments for the `prewarm gen` subcommand.
#[derive(Debug, Default, Parser)]
pub(crate) struct GenCommand {
    /// Override the transfer route for this run.
    ///
    /// Accepts `direct`, `object-storage` (`oss`), or `network-share`
    /// (`nas`).
    #[arg(long, value_name = "ROUTE")]
    pub(crate) route: Option<String>,
    /// Override the project directory whose code is deployed.
    #[arg(long, value_name = "PATH")]
    pub(crate) project_dir: Option<String>,
}

/// Arguments for the `prewarm enable` subcommand.
#[derive(Debug, Default, Parser)]
pub(crate) struct EnableCommand {
    /// Production service to update.
    #[arg(long, value_name = "SERVICE")]
    pub(crate) service: Option<String>,
    /// Production function to update.
    #[arg(long, value_name = "FUNCTION")]
    pub(crate) function: Option<String>,
}
