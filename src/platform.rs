//! Contract for the remote compute platform hosting the helper function.
//!
//! The pipeline and the cleanup phase speak only to [`ComputePlatform`]; the
//! HTTP client in [`crate::fc`] and the recording double in
//! [`crate::test_support`] implement it. Delete operations must succeed when
//! the target is already gone.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Future returned by platform operations.
pub type PlatformFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Log destination attached to a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogConfig {
    /// Log project name.
    pub project: String,
    /// Log store name.
    pub logstore: String,
}

/// Private network attachment for a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VpcConfig {
    /// Virtual private cloud identifier.
    pub vpc_id: String,
    /// Switches the function instances attach to.
    pub vswitch_ids: Vec<String>,
    /// Security group applied to the instances.
    pub security_group_id: String,
}

/// A network share mounted into the function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NasMountPoint {
    /// Share address, including the export path.
    pub server_addr: String,
    /// Mount location inside the function.
    pub mount_dir: String,
}

/// Network share configuration for a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NasConfig {
    /// User the function accesses the share as.
    pub user_id: i64,
    /// Group the function accesses the share as.
    pub group_id: i64,
    /// Shares to mount.
    pub mount_points: Vec<NasMountPoint>,
}

/// Parameters for creating a service.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceSpec {
    /// Service name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Role the service assumes.
    pub role: Option<String>,
    /// Log destination.
    pub log: Option<LogConfig>,
    /// Private network attachment.
    pub vpc: Option<VpcConfig>,
    /// Network share mounts.
    pub nas: Option<NasConfig>,
}

/// Where the function code comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FunctionCode {
    /// Base64-encoded zip carried inline in the request.
    Inline {
        /// Encoded archive.
        zip_base64: String,
    },
    /// Zip previously uploaded to object storage.
    ObjectStorage {
        /// Bucket holding the archive.
        bucket: String,
        /// Object key of the archive.
        object: String,
    },
}

/// Parameters for creating a function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FunctionSpec {
    /// Function name.
    pub name: String,
    /// Entry point.
    pub handler: String,
    /// Runtime identifier, for example `python3` or `java11`.
    pub runtime: String,
    /// Memory limit in MiB.
    pub memory_mb: u32,
    /// Invocation timeout in seconds.
    pub timeout_secs: u32,
    /// Initializer entry point.
    pub initializer: Option<String>,
    /// Initializer timeout in seconds.
    pub initialization_timeout_secs: u32,
    /// Instance class.
    pub instance_type: String,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Code source.
    pub code: FunctionCode,
}

/// Parameters for creating an HTTP trigger.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TriggerSpec {
    /// Trigger name.
    pub name: String,
    /// Trigger type; always `http` for the helper.
    pub trigger_type: String,
    /// Version or alias the trigger targets.
    pub qualifier: String,
    /// Authentication mode.
    pub auth_type: String,
    /// Accepted HTTP methods.
    pub methods: Vec<String>,
}

impl TriggerSpec {
    /// Anonymous HTTP trigger accepting `POST` and `GET` on `LATEST`.
    #[must_use]
    pub fn http(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger_type: String::from("http"),
            qualifier: String::from("LATEST"),
            auth_type: String::from("anonymous"),
            methods: vec![String::from("POST"), String::from("GET")],
        }
    }
}

/// Operations the pipeline needs from the compute platform.
pub trait ComputePlatform {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a service.
    fn create_service<'a>(&'a self, spec: &'a ServiceSpec) -> PlatformFuture<'a, (), Self::Error>;

    /// Creates a function inside `service`.
    fn create_function<'a>(
        &'a self,
        service: &'a str,
        spec: &'a FunctionSpec,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Creates a trigger on `function`.
    fn create_trigger<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        spec: &'a TriggerSpec,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Posts `body` to the function's HTTP trigger at `path` and returns the
    /// response body.
    fn invoke<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        path: &'a str,
        body: String,
    ) -> PlatformFuture<'a, String, Self::Error>;

    /// Replaces the function's environment variables.
    fn update_function_environment<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        environment: &'a BTreeMap<String, String>,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Lists alias names under `service`.
    fn list_aliases<'a>(&'a self, service: &'a str) -> PlatformFuture<'a, Vec<String>, Self::Error>;

    /// Lists version identifiers under `service`.
    fn list_versions<'a>(&'a self, service: &'a str)
    -> PlatformFuture<'a, Vec<String>, Self::Error>;

    /// Lists function names under `service`.
    fn list_functions<'a>(
        &'a self,
        service: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error>;

    /// Lists trigger names on `function`.
    fn list_triggers<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error>;

    /// Deletes an alias.
    fn delete_alias<'a>(
        &'a self,
        service: &'a str,
        alias: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Deletes a version.
    fn delete_version<'a>(
        &'a self,
        service: &'a str,
        version: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Deletes a trigger.
    fn delete_trigger<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        trigger: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Deletes a function.
    fn delete_function<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error>;

    /// Deletes a service.
    fn delete_service<'a>(&'a self, service: &'a str) -> PlatformFuture<'a, (), Self::Error>;
}
