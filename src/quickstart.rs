//! Enables the generated cache on the production function.
//!
//! The production function loads the cache through a wrapper script named
//! by `BOOTSTRAP_WRAPPER`, reading shared data from `SRPATH`.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::platform::ComputePlatform;

/// Environment variable naming the startup wrapper script.
pub const BOOTSTRAP_WRAPPER_VAR: &str = "BOOTSTRAP_WRAPPER";

/// Environment variable naming the shared data directory.
pub const SHARED_PATH_VAR: &str = "SRPATH";

/// Errors raised while enabling the cache.
#[derive(Debug, Error)]
pub enum QuickstartError {
    /// The platform rejected the update.
    #[error("failed to update {service}/{function}: {message}")]
    Update {
        /// Target service.
        service: String,
        /// Target function.
        function: String,
        /// Platform error message.
        message: String,
    },
}

/// Production function whose environment is updated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuickstartTarget {
    /// Service name.
    pub service: String,
    /// Function name.
    pub function: String,
    /// Wrapper script path inside the function.
    pub wrapper: String,
    /// Shared data directory inside the function.
    pub remote_path: String,
}

impl QuickstartTarget {
    /// Builds the environment: `overlay` plus the wrapper and shared path,
    /// which take precedence.
    #[must_use]
    pub fn environment(&self, overlay: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut environment = overlay.clone();
        environment.insert(String::from(BOOTSTRAP_WRAPPER_VAR), self.wrapper.clone());
        environment.insert(String::from(SHARED_PATH_VAR), self.remote_path.clone());
        environment
    }
}

/// Replaces the production function's environment so it starts through the
/// quickstart wrapper.
///
/// # Errors
///
/// Returns [`QuickstartError::Update`] when the platform call fails.
pub async fn enable_quickstart<P>(
    platform: &P,
    target: &QuickstartTarget,
    overlay: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, QuickstartError>
where
    P: ComputePlatform + Sync,
{
    let environment = target.environment(overlay);
    platform
        .update_function_environment(&target.service, &target.function, &environment)
        .await
        .map_err(|err| QuickstartError::Update {
            service: target.service.clone(),
            function: target.function.clone(),
            message: err.to_string(),
        })?;
    tracing::info!(
        service = %target.service,
        function = %target.function,
        wrapper = %target.wrapper,
        "quickstart enabled"
    );
    Ok(environment)
}
