//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here keep their state behind `Arc<Mutex<_>>`, so clones share
//! one script and one call log and can be handed to code that requires
//! `Send + Sync` collaborators.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::config::{DEFAULT_QUICKSTART_WRAPPER, DEFAULT_REMOTE_PATH, PipelineConfig};
use crate::ledger::ResourceLedger;
use crate::platform::{ComputePlatform, FunctionSpec, PlatformFuture, ServiceSpec, TriggerSpec};
use crate::protocol::{ARCHIVE_NAME, HelperCommand};
use crate::share::{NetworkShare, ShareError};
use crate::stage::{ArtifactStager, StageFuture, StagedWorkspace, StagingError};
use crate::storage::{ObjectStorage, StorageError};
use crate::transfer::{ChannelFuture, DEFAULT_CHUNK_SIZE, InvocationChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Sets a single environment variable while holding the global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Error produced by the in-memory doubles.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("simulated {operation} failure: {message}")]
pub struct DoubleError {
    /// Operation that failed.
    pub operation: String,
    /// What went wrong.
    pub message: String,
}

impl DoubleError {
    fn new(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_owned(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct PlatformState {
    calls: Vec<String>,
    failures: BTreeSet<String>,
    services: BTreeSet<String>,
    functions: BTreeMap<String, BTreeSet<String>>,
    triggers: BTreeMap<(String, String), BTreeSet<String>>,
    aliases: BTreeMap<String, BTreeSet<String>>,
    versions: BTreeMap<String, BTreeSet<String>>,
    published_aliases: Vec<String>,
    published_versions: Vec<String>,
    service_specs: Vec<ServiceSpec>,
    function_specs: Vec<FunctionSpec>,
    environments: Vec<(String, String, BTreeMap<String, String>)>,
    commands: Vec<HelperCommand>,
    dump_response: Option<String>,
    payload: Vec<u8>,
    storage: Option<MemoryStorage>,
    share: Option<RecordingShare>,
}

/// In-memory [`ComputePlatform`] that records every call.
///
/// Creations and deletions update an internal model of live resources, so a
/// test can assert that everything created was also removed. Deleting a
/// service that still holds functions, or a function that still holds
/// triggers, fails the way the real platform does.
///
/// The deployed helper is simulated too: `size` and `range` commands are
/// answered from the configured payload, and a successful `dump` places the
/// payload into attached object storage or network share doubles.
#[derive(Clone, Debug, Default)]
pub struct RecordingPlatform {
    state: Arc<Mutex<PlatformState>>,
}

type PlatformResult<T> = Result<T, DoubleError>;

impl RecordingPlatform {
    /// Creates a platform with no resources and a successful helper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `operation` (for example `create_function`) fail.
    #[must_use]
    pub fn failing(self, operation: &str) -> Self {
        lock(&self.state).failures.insert(operation.to_owned());
        self
    }

    /// Sets the file the helper serves and uploads.
    #[must_use]
    pub fn with_payload(self, payload: Vec<u8>) -> Self {
        lock(&self.state).payload = payload;
        self
    }

    /// Sets the body returned for `dump` commands.
    #[must_use]
    pub fn with_dump_response(self, response: impl Into<String>) -> Self {
        lock(&self.state).dump_response = Some(response.into());
        self
    }

    /// Publishes an alias on every service created from now on.
    #[must_use]
    pub fn with_published_alias(self, alias: impl Into<String>) -> Self {
        lock(&self.state).published_aliases.push(alias.into());
        self
    }

    /// Publishes a version on every service created from now on.
    #[must_use]
    pub fn with_published_version(self, version: impl Into<String>) -> Self {
        lock(&self.state).published_versions.push(version.into());
        self
    }

    /// Lets a successful dump upload the payload into `storage`.
    #[must_use]
    pub fn with_storage(self, storage: MemoryStorage) -> Self {
        lock(&self.state).storage = Some(storage);
        self
    }

    /// Lets a successful dump write the payload onto `share`.
    #[must_use]
    pub fn with_share(self, share: RecordingShare) -> Self {
        lock(&self.state).share = Some(share);
        self
    }

    /// Seeds an existing service, for example to exercise cleanup directly.
    pub fn seed_service(&self, service: &str) {
        let mut state = lock(&self.state);
        state.services.insert(service.to_owned());
        state.functions.entry(service.to_owned()).or_default();
    }

    /// Seeds an existing function under `service`.
    pub fn seed_function(&self, service: &str, function: &str) {
        lock(&self.state)
            .functions
            .entry(service.to_owned())
            .or_default()
            .insert(function.to_owned());
    }

    /// Seeds an existing trigger on `function`.
    pub fn seed_trigger(&self, service: &str, function: &str, trigger: &str) {
        lock(&self.state)
            .triggers
            .entry((service.to_owned(), function.to_owned()))
            .or_default()
            .insert(trigger.to_owned());
    }

    /// Seeds an existing alias under `service`.
    pub fn seed_alias(&self, service: &str, alias: &str) {
        lock(&self.state)
            .aliases
            .entry(service.to_owned())
            .or_default()
            .insert(alias.to_owned());
    }

    /// Seeds an existing version under `service`.
    pub fn seed_version(&self, service: &str, version: &str) {
        lock(&self.state)
            .versions
            .entry(service.to_owned())
            .or_default()
            .insert(version.to_owned());
    }

    /// Every call made so far, for example `delete_trigger svc/fn/trg`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Calls whose rendering starts with `operation`.
    #[must_use]
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split_whitespace().next() == Some(operation))
            .collect()
    }

    /// Helper commands received through `invoke`, decoded.
    #[must_use]
    pub fn commands(&self) -> Vec<HelperCommand> {
        lock(&self.state).commands.clone()
    }

    /// Service specifications passed to `create_service`.
    #[must_use]
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        lock(&self.state).service_specs.clone()
    }

    /// Function specifications passed to `create_function`.
    #[must_use]
    pub fn function_specs(&self) -> Vec<FunctionSpec> {
        lock(&self.state).function_specs.clone()
    }

    /// Environment updates as `(service, function, environment)`.
    #[must_use]
    pub fn environment_updates(&self) -> Vec<(String, String, BTreeMap<String, String>)> {
        lock(&self.state).environments.clone()
    }

    /// Resources that currently exist, rendered like ledger entries.
    #[must_use]
    pub fn live_resources(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut live = Vec::new();
        for (service, names) in &state.aliases {
            live.extend(names.iter().map(|name| format!("alias {service}/{name}")));
        }
        for (service, ids) in &state.versions {
            live.extend(ids.iter().map(|id| format!("version {service}/{id}")));
        }
        for ((service, function), names) in &state.triggers {
            live.extend(
                names
                    .iter()
                    .map(|name| format!("trigger {service}/{function}/{name}")),
            );
        }
        for (service, names) in &state.functions {
            live.extend(names.iter().map(|name| format!("function {service}/{name}")));
        }
        live.extend(state.services.iter().map(|name| format!("service {name}")));
        live
    }

    fn begin(&self, operation: &str, target: &str) -> PlatformResult<MutexGuard<'_, PlatformState>> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{operation} {target}"));
        if state.failures.contains(operation) {
            return Err(DoubleError::new(operation, target));
        }
        Ok(state)
    }

    fn create_service_now(&self, spec: &ServiceSpec) -> PlatformResult<()> {
        let mut state = self.begin("create_service", &spec.name)?;
        if !state.services.insert(spec.name.clone()) {
            return Err(DoubleError::new("create_service", "service already exists"));
        }
        state.functions.entry(spec.name.clone()).or_default();
        let aliases: BTreeSet<String> = state.published_aliases.iter().cloned().collect();
        let versions: BTreeSet<String> = state.published_versions.iter().cloned().collect();
        if !aliases.is_empty() {
            state.aliases.insert(spec.name.clone(), aliases);
        }
        if !versions.is_empty() {
            state.versions.insert(spec.name.clone(), versions);
        }
        state.service_specs.push(spec.clone());
        Ok(())
    }

    fn create_function_now(&self, service: &str, spec: &FunctionSpec) -> PlatformResult<()> {
        let mut state = self.begin("create_function", &format!("{service}/{}", spec.name))?;
        if !state.services.contains(service) {
            return Err(DoubleError::new("create_function", "service not found"));
        }
        state
            .functions
            .entry(service.to_owned())
            .or_default()
            .insert(spec.name.clone());
        state.function_specs.push(spec.clone());
        Ok(())
    }

    fn create_trigger_now(&self, service: &str, function: &str, spec: &TriggerSpec) -> PlatformResult<()> {
        let mut state = self.begin(
            "create_trigger",
            &format!("{service}/{function}/{}", spec.name),
        )?;
        if !has_function(&state, service, function) {
            return Err(DoubleError::new("create_trigger", "function not found"));
        }
        state
            .triggers
            .entry((service.to_owned(), function.to_owned()))
            .or_default()
            .insert(spec.name.clone());
        Ok(())
    }

    fn invoke_now(&self, service: &str, function: &str, path: &str, body: &str) -> PlatformResult<String> {
        let mut state = self.begin("invoke", &format!("{service}/{function}/{path}"))?;
        if !has_function(&state, service, function) {
            return Err(DoubleError::new("invoke", "function not found"));
        }
        let command = HelperCommand::decode(body)
            .map_err(|err| DoubleError::new("invoke", err.to_string()))?;
        state.commands.push(command.clone());
        match command {
            HelperCommand::Size { .. } => Ok(state.payload.len().to_string()),
            HelperCommand::Range { start, size, .. } => {
                let begin = usize::try_from(start).unwrap_or(usize::MAX);
                let end = begin.saturating_add(usize::try_from(size).unwrap_or(usize::MAX));
                let chunk = state
                    .payload
                    .get(begin..end.min(state.payload.len()))
                    .unwrap_or_default();
                Ok(STANDARD.encode(chunk))
            }
            HelperCommand::Dump(request) => {
                let response = state
                    .dump_response
                    .clone()
                    .unwrap_or_else(|| String::from("success"));
                if !response.starts_with("success") {
                    return Ok(response);
                }
                if let (Some(storage), Some(upload)) = (&state.storage, &request.storage) {
                    storage.insert(&upload.bucket, ARCHIVE_NAME, state.payload.clone());
                }
                if let Some(share) = &state.share {
                    share.insert(&request.archive_file, state.payload.clone());
                }
                Ok(response)
            }
        }
    }

    fn update_environment_now(
        &self,
        service: &str,
        function: &str,
        environment: &BTreeMap<String, String>,
    ) -> PlatformResult<()> {
        let mut state = self.begin("update_function_environment", &format!("{service}/{function}"))?;
        state
            .environments
            .push((service.to_owned(), function.to_owned(), environment.clone()));
        Ok(())
    }

    fn list_now(&self, operation: &str, target: &str, items: impl FnOnce(&PlatformState) -> Vec<String>) -> PlatformResult<Vec<String>> {
        let state = self.begin(operation, target)?;
        Ok(items(&state))
    }

    fn delete_now(
        &self,
        operation: &str,
        target: &str,
        remove: impl FnOnce(&mut PlatformState) -> PlatformResult<()>,
    ) -> PlatformResult<()> {
        let mut state = self.begin(operation, target)?;
        remove(&mut state)
    }
}

fn has_function(state: &PlatformState, service: &str, function: &str) -> bool {
    state
        .functions
        .get(service)
        .is_some_and(|functions| functions.contains(function))
}

fn names(map: &BTreeMap<String, BTreeSet<String>>, key: &str) -> Vec<String> {
    map.get(key)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}

fn ready<'a, T: Send + 'a>(result: PlatformResult<T>) -> PlatformFuture<'a, T, DoubleError> {
    Box::pin(std::future::ready(result))
}

impl ComputePlatform for RecordingPlatform {
    type Error = DoubleError;

    fn create_service<'a>(&'a self, spec: &'a ServiceSpec) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.create_service_now(spec))
    }

    fn create_function<'a>(
        &'a self,
        service: &'a str,
        spec: &'a FunctionSpec,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.create_function_now(service, spec))
    }

    fn create_trigger<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        spec: &'a TriggerSpec,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.create_trigger_now(service, function, spec))
    }

    fn invoke<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        path: &'a str,
        body: String,
    ) -> PlatformFuture<'a, String, Self::Error> {
        ready(self.invoke_now(service, function, path, &body))
    }

    fn update_function_environment<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        environment: &'a BTreeMap<String, String>,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.update_environment_now(service, function, environment))
    }

    fn list_aliases<'a>(&'a self, service: &'a str) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        ready(self.list_now("list_aliases", service, |state| {
            names(&state.aliases, service)
        }))
    }

    fn list_versions<'a>(
        &'a self,
        service: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        ready(self.list_now("list_versions", service, |state| {
            names(&state.versions, service)
        }))
    }

    fn list_functions<'a>(
        &'a self,
        service: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        ready(self.list_now("list_functions", service, |state| {
            names(&state.functions, service)
        }))
    }

    fn list_triggers<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
    ) -> PlatformFuture<'a, Vec<String>, Self::Error> {
        ready(self.list_now(
            "list_triggers",
            &format!("{service}/{function}"),
            |state| {
                state
                    .triggers
                    .get(&(service.to_owned(), function.to_owned()))
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default()
            },
        ))
    }

    fn delete_alias<'a>(
        &'a self,
        service: &'a str,
        alias: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.delete_now("delete_alias", &format!("{service}/{alias}"), |state| {
            if let Some(set) = state.aliases.get_mut(service) {
                set.remove(alias);
            }
            Ok(())
        }))
    }

    fn delete_version<'a>(
        &'a self,
        service: &'a str,
        version: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.delete_now("delete_version", &format!("{service}/{version}"), |state| {
            if state.aliases.get(service).is_some_and(|set| !set.is_empty()) {
                return Err(DoubleError::new("delete_version", "version is still aliased"));
            }
            if let Some(set) = state.versions.get_mut(service) {
                set.remove(version);
            }
            Ok(())
        }))
    }

    fn delete_trigger<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
        trigger: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.delete_now(
            "delete_trigger",
            &format!("{service}/{function}/{trigger}"),
            |state| {
                if let Some(set) = state
                    .triggers
                    .get_mut(&(service.to_owned(), function.to_owned()))
                {
                    set.remove(trigger);
                }
                Ok(())
            },
        ))
    }

    fn delete_function<'a>(
        &'a self,
        service: &'a str,
        function: &'a str,
    ) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.delete_now(
            "delete_function",
            &format!("{service}/{function}"),
            |state| {
                let key = (service.to_owned(), function.to_owned());
                if state.triggers.get(&key).is_some_and(|set| !set.is_empty()) {
                    return Err(DoubleError::new("delete_function", "function still has triggers"));
                }
                state.triggers.remove(&key);
                if let Some(set) = state.functions.get_mut(service) {
                    set.remove(function);
                }
                Ok(())
            },
        ))
    }

    fn delete_service<'a>(&'a self, service: &'a str) -> PlatformFuture<'a, (), Self::Error> {
        ready(self.delete_now("delete_service", service, |state| {
            let busy = |map: &BTreeMap<String, BTreeSet<String>>| {
                map.get(service).is_some_and(|set| !set.is_empty())
            };
            if busy(&state.functions) || busy(&state.aliases) || busy(&state.versions) {
                return Err(DoubleError::new("delete_service", "service is not empty"));
            }
            state.functions.remove(service);
            state.aliases.remove(service);
            state.versions.remove(service);
            state.services.remove(service);
            Ok(())
        }))
    }
}

#[derive(Debug, Default)]
struct StorageState {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    calls: Vec<String>,
    failures: BTreeSet<String>,
}

/// In-memory [`ObjectStorage`] recording every call.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

fn storage_failure(operation: &str, message: impl Into<String>) -> StorageError {
    StorageError::Command(CommandError::Failure {
        program: String::from("memory-storage"),
        status: Some(1),
        status_text: String::from("1"),
        stderr: format!("{operation}: {}", message.into()),
    })
}

impl MemoryStorage {
    /// Creates storage with no buckets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty bucket.
    #[must_use]
    pub fn with_bucket(self, bucket: &str) -> Self {
        lock(&self.state).buckets.entry(bucket.to_owned()).or_default();
        self
    }

    /// Makes every call of `operation` (for example `delete_bucket`) fail.
    #[must_use]
    pub fn failing(self, operation: &str) -> Self {
        lock(&self.state).failures.insert(operation.to_owned());
        self
    }

    /// Stores an object directly, creating the bucket if needed.
    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        lock(&self.state)
            .buckets
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned(), bytes);
    }

    /// Returns the bucket names that exist.
    #[must_use]
    pub fn buckets(&self) -> Vec<String> {
        lock(&self.state).buckets.keys().cloned().collect()
    }

    /// Returns the object keys stored in `bucket`.
    #[must_use]
    pub fn objects(&self, bucket: &str) -> Vec<String> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the stored bytes of `bucket/key`.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    /// Every call made so far, for example `put b/k`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn begin(&self, operation: &str, target: &str) -> Result<MutexGuard<'_, StorageState>, StorageError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{operation} {target}"));
        if state.failures.contains(operation) {
            return Err(storage_failure(operation, "simulated failure"));
        }
        Ok(state)
    }
}

impl ObjectStorage for MemoryStorage {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let state = self.begin("bucket_exists", bucket)?;
        Ok(state.buckets.contains_key(bucket))
    }

    fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let mut state = self.begin("create_bucket", bucket)?;
        state.buckets.entry(bucket.to_owned()).or_default();
        Ok(())
    }

    fn put(&self, bucket: &str, key: &str, source: &Utf8Path) -> Result<(), StorageError> {
        let mut state = self.begin("put", &format!("{bucket}/{key}"))?;
        let bytes = std::fs::read(source).map_err(|err| storage_failure("put", err.to_string()))?;
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| storage_failure("put", "NoSuchBucket"))?;
        objects.insert(key.to_owned(), bytes);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str, dest: &Utf8Path) -> Result<(), StorageError> {
        let state = self.begin("get", &format!("{bucket}/{key}"))?;
        let bytes = state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .ok_or_else(|| storage_failure("get", "NoSuchKey"))?;
        std::fs::write(dest, bytes).map_err(|err| storage_failure("get", err.to_string()))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut state = self.begin("delete", &format!("{bucket}/{key}"))?;
        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    fn list(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let state = self.begin("list", bucket)?;
        state
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .ok_or_else(|| storage_failure("list", "NoSuchBucket"))
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let mut state = self.begin("delete_bucket", bucket)?;
        if state.buckets.get(bucket).is_some_and(|objects| !objects.is_empty()) {
            return Err(storage_failure("delete_bucket", "BucketNotEmpty"));
        }
        state.buckets.remove(bucket);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ShareState {
    files: BTreeMap<String, Vec<u8>>,
    calls: Vec<String>,
    failures: BTreeSet<String>,
}

/// In-memory [`NetworkShare`] recording every call.
#[derive(Clone, Debug, Default)]
pub struct RecordingShare {
    state: Arc<Mutex<ShareState>>,
}

fn share_failure(operation: &str, message: impl Into<String>) -> ShareError {
    ShareError::Command(CommandError::Failure {
        program: String::from("s"),
        status: Some(1),
        status_text: String::from("1"),
        stderr: format!("{operation}: {}", message.into()),
    })
}

impl RecordingShare {
    /// Creates an empty share.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `operation` (`pull`, `push`, or `clear`) fail.
    #[must_use]
    pub fn failing(self, operation: &str) -> Self {
        lock(&self.state).failures.insert(operation.to_owned());
        self
    }

    /// Stores a file on the share.
    pub fn insert(&self, remote: &str, bytes: Vec<u8>) {
        lock(&self.state).files.insert(remote.to_owned(), bytes);
    }

    /// Remote paths currently on the share.
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        lock(&self.state).files.keys().cloned().collect()
    }

    /// Every call made so far, for example `clear /tmp/share`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn begin(&self, operation: &str, target: &str) -> Result<MutexGuard<'_, ShareState>, ShareError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{operation} {target}"));
        if state.failures.contains(operation) {
            return Err(share_failure(operation, "simulated failure"));
        }
        Ok(state)
    }
}

impl NetworkShare for RecordingShare {
    fn pull(&self, remote: &str, local: &Utf8Path) -> Result<(), ShareError> {
        let state = self.begin("pull", remote)?;
        let bytes = state.files.get(remote).ok_or_else(|| ShareError::Missing {
            remote: remote.to_owned(),
            local: local.to_string(),
        })?;
        std::fs::write(local, bytes).map_err(|err| ShareError::Local {
            path: local.to_string(),
            message: err.to_string(),
        })
    }

    fn push(&self, local: &Utf8Path, remote: &str) -> Result<(), ShareError> {
        let mut state = self.begin("push", remote)?;
        let bytes = std::fs::read(local).map_err(|err| ShareError::Local {
            path: local.to_string(),
            message: err.to_string(),
        })?;
        state.files.insert(remote.to_owned(), bytes);
        Ok(())
    }

    fn clear(&self, remote: &str) -> Result<(), ShareError> {
        let mut state = self.begin("clear", remote)?;
        let prefix = format!("{}/", remote.trim_end_matches('/'));
        state
            .files
            .retain(|path, _| path != remote && !path.starts_with(&prefix));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    payload: Vec<u8>,
    size_response: Option<String>,
    truncate_at: Option<u64>,
    fail_at: Option<u64>,
    requests: Vec<HelperCommand>,
}

/// [`InvocationChannel`] serving a fixed payload, with optional faults.
#[derive(Clone, Debug, Default)]
pub struct ScriptedChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl ScriptedChannel {
    /// Serves `payload` for size and range commands.
    #[must_use]
    pub fn serving(payload: Vec<u8>) -> Self {
        let channel = Self::default();
        lock(&channel.state).payload = payload;
        channel
    }

    /// Replaces the body returned for size queries.
    #[must_use]
    pub fn with_size_response(self, body: impl Into<String>) -> Self {
        lock(&self.state).size_response = Some(body.into());
        self
    }

    /// Returns one byte fewer than requested for the range at `offset`.
    #[must_use]
    pub fn truncating_at(self, offset: u64) -> Self {
        lock(&self.state).truncate_at = Some(offset);
        self
    }

    /// Fails the range request at `offset`.
    #[must_use]
    pub fn failing_at(self, offset: u64) -> Self {
        lock(&self.state).fail_at = Some(offset);
        self
    }

    /// Every command received.
    #[must_use]
    pub fn requests(&self) -> Vec<HelperCommand> {
        lock(&self.state).requests.clone()
    }

    /// Range requests received, as `(offset, length)`.
    #[must_use]
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.requests()
            .into_iter()
            .filter_map(|command| match command {
                HelperCommand::Range { start, size, .. } => Some((start, size)),
                HelperCommand::Size { .. } | HelperCommand::Dump(_) => None,
            })
            .collect()
    }

    fn respond(&self, command: &HelperCommand) -> Result<String, DoubleError> {
        let mut state = lock(&self.state);
        state.requests.push(command.clone());
        match command {
            HelperCommand::Size { .. } => Ok(state
                .size_response
                .clone()
                .unwrap_or_else(|| state.payload.len().to_string())),
            HelperCommand::Range { start, size, .. } => {
                if state.fail_at == Some(*start) {
                    return Err(DoubleError::new("range", format!("offset {start}")));
                }
                let begin = usize::try_from(*start).unwrap_or(usize::MAX);
                let mut length = usize::try_from(*size).unwrap_or(usize::MAX);
                if state.truncate_at == Some(*start) {
                    length = length.saturating_sub(1);
                }
                let end = begin.saturating_add(length).min(state.payload.len());
                let chunk = state.payload.get(begin..end).unwrap_or_default();
                Ok(STANDARD.encode(chunk))
            }
            HelperCommand::Dump(_) => Ok(String::from("success")),
        }
    }
}

impl InvocationChannel for ScriptedChannel {
    type Error = DoubleError;

    fn call<'a>(&'a self, command: &'a HelperCommand) -> ChannelFuture<'a, Self::Error> {
        Box::pin(std::future::ready(self.respond(command)))
    }
}

/// [`ArtifactStager`] that writes fixed files.
#[derive(Clone, Debug, Default)]
pub struct FixtureStager {
    files: Vec<(String, Vec<u8>)>,
    user_files: Vec<(String, Vec<u8>)>,
    injected: Option<Utf8PathBuf>,
    fail: bool,
}

impl FixtureStager {
    /// Creates a stager that writes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a workspace file.
    #[must_use]
    pub fn with_file(mut self, relative: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((relative.to_owned(), contents.into()));
        self
    }

    /// Adds a file copied into the artefact directory.
    #[must_use]
    pub fn with_user_file(mut self, relative: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.user_files.push((relative.to_owned(), contents.into()));
        self
    }

    /// Creates `path` during staging and records it in the ledger, like an
    /// injected helper source.
    #[must_use]
    pub fn injecting(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.injected = Some(path.into());
        self
    }

    /// Makes staging fail.
    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

fn write_files(root: &Utf8Path, files: &[(String, Vec<u8>)]) -> Result<usize, StagingError> {
    for (relative, contents) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StagingError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            })?;
        }
        std::fs::write(&path, contents).map_err(|err| StagingError::Io {
            path,
            message: err.to_string(),
        })?;
    }
    Ok(files.len())
}

impl ArtifactStager for FixtureStager {
    fn stage<'a>(
        &'a self,
        workspace: &'a Utf8Path,
        ledger: &'a mut ResourceLedger,
    ) -> StageFuture<'a, StagedWorkspace> {
        Box::pin(async move {
            if let Some(path) = &self.injected {
                write_files(path.parent().unwrap_or(workspace), &[(
                    path.file_name().unwrap_or("helper").to_owned(),
                    b"helper".to_vec(),
                )])?;
                ledger.record_local_path(path.clone());
            }
            if self.fail {
                return Err(StagingError::Io {
                    path: workspace.to_path_buf(),
                    message: String::from("simulated staging failure"),
                });
            }
            std::fs::create_dir_all(workspace).map_err(|err| StagingError::Io {
                path: workspace.to_path_buf(),
                message: err.to_string(),
            })?;
            let files = write_files(workspace, &self.files)?;
            Ok(StagedWorkspace {
                root: workspace.to_path_buf(),
                files,
            })
        })
    }

    fn copy_user_artifact<'a>(&'a self, dest: &'a Utf8Path) -> StageFuture<'a, usize> {
        Box::pin(async move { write_files(dest, &self.user_files) })
    }
}

/// Builds a gzip-compressed tarball holding `files`.
///
/// # Errors
///
/// Returns any I/O error raised while building the archive.
pub fn gzip_tarball(files: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(u64::try_from(contents.len()).unwrap_or(u64::MAX));
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents)?;
    }
    let mut compressed = builder.into_inner()?;
    compressed.flush()?;
    compressed.finish()
}

/// Configuration carrying the loader defaults plus a region and explicit
/// credentials, for tests that build settings without touching the
/// environment.
#[must_use]
pub fn sample_config() -> PipelineConfig {
    PipelineConfig {
        region: String::from("cn-hangzhou"),
        fc_endpoint: None,
        account_id: Some(String::from("1234")),
        access_key_id: Some(String::from("ak")),
        access_key_secret: Some(String::from("sk")),
        profile: None,
        runtime: String::from("python3"),
        handler: None,
        initializer: None,
        memory_mb: 1024,
        timeout_secs: 300,
        init_timeout_secs: 300,
        instance_type: String::from("c1"),
        route: String::from("direct"),
        remote_path: String::from(DEFAULT_REMOTE_PATH),
        shared_dir_name: String::from("runtime.data.share"),
        project_dir: String::from("."),
        artifact_dir: String::from("target/artifact"),
        helper_dir: None,
        role: None,
        log_project: None,
        log_store: None,
        vpc_id: None,
        vswitch_id: None,
        security_group_id: None,
        nas_server_addr: None,
        nas_mount_dir: None,
        nas_user_id: None,
        nas_group_id: None,
        oss_endpoint: None,
        local_oss_endpoint: None,
        ossutil_url: None,
        ossutil_bin: String::from("ossutil64"),
        s_bin: String::from("s"),
        publish_bucket: None,
        publish_key: None,
        publish_archive: None,
        target_service: None,
        target_function: None,
        quickstart_wrapper: String::from(DEFAULT_QUICKSTART_WRAPPER),
        chunk_size_bytes: DEFAULT_CHUNK_SIZE,
        function_env: None,
    }
}
