//! Workspace staging for the helper function.
//!
//! The pipeline only needs an [`ArtifactStager`]: something that fills a
//! fresh directory with the files the helper function runs from, and later
//! copies the user's deployable files next to the generated cache. The
//! [`WorkspaceStager`] is the default implementation; a [`RuntimeProfile`]
//! captures what differs between Python, Java, and Node.js projects.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::try_join_all;
use thiserror::Error;
use walkdir::WalkDir;

use crate::command::{CommandError, CommandRunner};
use crate::ledger::ResourceLedger;

/// Future returned by [`ArtifactStager`] operations.
pub type StageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StagingError>> + Send + 'a>>;

/// File name the object storage client is saved under in the workspace.
pub const OSSUTIL_FILE_NAME: &str = "ossutil64";

/// Errors raised while staging a workspace.
#[derive(Debug, Error)]
pub enum StagingError {
    /// The runtime identifier matches no known profile.
    #[error("unsupported runtime: {runtime}")]
    UnsupportedRuntime {
        /// Runtime identifier as configured.
        runtime: String,
    },
    /// A filesystem operation failed.
    #[error("failed to stage {path}: {message}")]
    Io {
        /// Path being read or written.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// A build step exited unsuccessfully.
    #[error("build step `{step}` failed: {source}")]
    Build {
        /// Rendered command line of the step.
        step: String,
        /// Runner error.
        #[source]
        source: CommandError,
    },
    /// Downloading a bundled tool failed.
    #[error("failed to download {url}: {message}")]
    Download {
        /// Source URL.
        url: String,
        /// Underlying error message.
        message: String,
    },
}

impl StagingError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Result of staging: the workspace root and how many files it received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedWorkspace {
    /// Directory to be archived.
    pub root: Utf8PathBuf,
    /// Number of files copied or written.
    pub files: usize,
}

/// Populates the helper workspace and the final artefact directory.
pub trait ArtifactStager {
    /// Fills `workspace` with everything the helper function needs.
    ///
    /// Files injected into the user's project are recorded in `ledger` so
    /// the cleanup phase removes them.
    fn stage<'a>(
        &'a self,
        workspace: &'a Utf8Path,
        ledger: &'a mut ResourceLedger,
    ) -> StageFuture<'a, StagedWorkspace>;

    /// Copies the user's deployable files into `dest`, returning the number
    /// of files copied.
    fn copy_user_artifact<'a>(&'a self, dest: &'a Utf8Path) -> StageFuture<'a, usize>;
}

/// Language family of a runtime identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeKind {
    /// `python*` and `custom*` runtimes.
    Python,
    /// `java*` runtimes.
    Java,
    /// `nodejs*` runtimes.
    NodeJs,
}

/// External command run while preparing a workspace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildStep {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl BuildStep {
    fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.to_owned(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Renders the step as a shell-like string for logs and errors.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Per-runtime differences in staging, invocation, and naming.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuntimeProfile {
    kind: RuntimeKind,
    runtime: String,
}

const JAVA_EXCLUDED: [&str; 3] = ["artifact", "sr", "dependency"];
const NODE_EXCLUDED: [&str; 3] = ["node_modules", "target", ".git"];

impl RuntimeProfile {
    /// Derives the profile from a runtime identifier such as `python3.9`.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::UnsupportedRuntime`] for unknown families.
    pub fn from_runtime(runtime: &str) -> Result<Self, StagingError> {
        let trimmed = runtime.trim();
        let kind = if trimmed.starts_with("python") || trimmed.starts_with("custom") {
            RuntimeKind::Python
        } else if trimmed.starts_with("java") {
            RuntimeKind::Java
        } else if trimmed.starts_with("nodejs") {
            RuntimeKind::NodeJs
        } else {
            return Err(StagingError::UnsupportedRuntime {
                runtime: runtime.to_owned(),
            });
        };
        Ok(Self {
            kind,
            runtime: trimmed.to_owned(),
        })
    }

    /// Runtime identifier passed to the platform.
    #[must_use]
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Language family.
    #[must_use]
    pub const fn kind(&self) -> RuntimeKind {
        self.kind
    }

    /// Entry point used when none is configured.
    #[must_use]
    pub const fn default_handler(&self) -> &'static str {
        match self.kind {
            RuntimeKind::Java => "AccelerationHelper::handleRequest",
            RuntimeKind::Python | RuntimeKind::NodeJs => "index.handler",
        }
    }

    /// Dump method the helper should use, if the runtime needs one.
    #[must_use]
    pub const fn dump_method(&self) -> Option<&'static str> {
        match self.kind {
            RuntimeKind::Java => Some("jcmd"),
            RuntimeKind::Python | RuntimeKind::NodeJs => None,
        }
    }

    /// Environment the helper function is created with.
    #[must_use]
    pub fn function_environment(&self, remote_path: &str, wrapper: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([(String::from("SRPATH"), remote_path.to_owned())]);
        if self.kind == RuntimeKind::Java {
            env.insert(
                String::from("DISABLE_JAVA11_QUICKSTART"),
                String::from("true"),
            );
            env.insert(String::from("BOOTSTRAP_WRAPPER"), wrapper.to_owned());
        }
        env
    }

    /// Directory whose contents become the function code.
    #[must_use]
    pub fn sources_dir(&self, project: &Utf8Path) -> Utf8PathBuf {
        match self.kind {
            RuntimeKind::Python => project.join("code"),
            RuntimeKind::Java => project.join("target"),
            RuntimeKind::NodeJs => project.to_path_buf(),
        }
    }

    /// Where the helper sources are injected into the project.
    #[must_use]
    pub fn helper_destination(&self, project: &Utf8Path, helper_dir: &Utf8Path) -> Utf8PathBuf {
        let name = helper_dir.file_name().unwrap_or("helper");
        match self.kind {
            RuntimeKind::Python => project.join("code").join(name),
            RuntimeKind::Java => project.join("src").join("main").join("java"),
            RuntimeKind::NodeJs => project.join(name),
        }
    }

    /// Steps run in the project before files are collected.
    #[must_use]
    pub fn prepare_steps(&self, project: &Utf8Path) -> Vec<BuildStep> {
        if self.kind != RuntimeKind::Java {
            return Vec::new();
        }
        let pom = project.join("pom.xml");
        vec![
            BuildStep::new(
                "mvn",
                ["-f", pom.as_str(), "clean", "compile", "-Dmaven.test.skip=true"],
            ),
            BuildStep::new(
                "mvn",
                [
                    String::from("-f"),
                    pom.to_string(),
                    format!("-DoutputDirectory={}", project.join("target").join("lib")),
                    String::from("dependency:copy-dependencies"),
                ],
            ),
        ]
    }

    /// Steps run in a directory after sources have been copied into it.
    #[must_use]
    pub fn install_steps(&self, dir: &Utf8Path) -> Vec<BuildStep> {
        if self.kind != RuntimeKind::NodeJs {
            return Vec::new();
        }
        vec![BuildStep::new(
            "npm",
            ["install", "--production", "--prefix", dir.as_str()],
        )]
    }

    /// Returns `true` when a top-level entry of [`Self::sources_dir`] is
    /// never shipped.
    #[must_use]
    pub fn excludes_top_level(&self, name: &str) -> bool {
        match self.kind {
            RuntimeKind::Python => false,
            RuntimeKind::Java => {
                JAVA_EXCLUDED.contains(&name) || name.starts_with("maven") || name.contains("sources")
            }
            RuntimeKind::NodeJs => NODE_EXCLUDED.contains(&name),
        }
    }

    /// Maps a path relative to [`Self::sources_dir`] onto its location in
    /// the workspace, or `None` when the entry is not shipped.
    ///
    /// Java class files are flattened out of `classes/`.
    #[must_use]
    pub fn destination(&self, relative: &Utf8Path) -> Option<Utf8PathBuf> {
        let mut components = relative.components();
        let first = components.next()?.as_str();
        if self.excludes_top_level(first) {
            return None;
        }
        if self.kind == RuntimeKind::Java && first == "classes" {
            let rest = components.as_path();
            return (!rest.as_str().is_empty()).then(|| rest.to_path_buf());
        }
        Some(relative.to_path_buf())
    }
}

/// Default [`ArtifactStager`] working from a local project tree.
#[derive(Clone, Debug)]
pub struct WorkspaceStager<R> {
    profile: RuntimeProfile,
    project_dir: Utf8PathBuf,
    helper_dir: Option<Utf8PathBuf>,
    ossutil_url: Option<String>,
    runner: R,
}

impl<R> WorkspaceStager<R>
where
    R: CommandRunner + Send + Sync,
{
    /// Creates a stager for `project_dir`.
    #[must_use]
    pub fn new(profile: RuntimeProfile, project_dir: impl Into<Utf8PathBuf>, runner: R) -> Self {
        Self {
            profile,
            project_dir: project_dir.into(),
            helper_dir: None,
            ossutil_url: None,
            runner,
        }
    }

    /// Injects the helper sources from `helper_dir` before building.
    #[must_use]
    pub fn with_helper_dir(mut self, helper_dir: Option<Utf8PathBuf>) -> Self {
        self.helper_dir = helper_dir;
        self
    }

    /// Bundles the object storage client downloaded from `url`.
    #[must_use]
    pub fn with_ossutil_url(mut self, url: Option<String>) -> Self {
        self.ossutil_url = url;
        self
    }

    fn run_steps(&self, steps: &[BuildStep]) -> Result<(), StagingError> {
        for step in steps {
            tracing::info!(step = %step.command_string(), "running build step");
            self.runner
                .run(&step.program, &step.args)
                .and_then(|output| output.check(&step.program))
                .map_err(|source| StagingError::Build {
                    step: step.command_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn inject_helper(&self, ledger: &mut ResourceLedger) -> Result<(), StagingError> {
        let Some(helper_dir) = &self.helper_dir else {
            return Ok(());
        };
        let target = self.profile.helper_destination(&self.project_dir, helper_dir);
        // Paths are recorded before copying so a partial copy is still removed.
        if !target.exists() {
            ledger.record_local_path(target.clone());
            copy_tree(helper_dir, &target)?;
            tracing::info!(helper = %target, "helper sources injected");
            return Ok(());
        }
        for entry in read_dir_names(helper_dir)? {
            let dest = target.join(&entry);
            if dest.exists() {
                continue;
            }
            ledger.record_local_path(dest.clone());
            copy_tree(&helper_dir.join(&entry), &dest)?;
        }
        tracing::info!(helper = %target, "helper sources merged");
        Ok(())
    }

    fn helper_class_stems(&self) -> Vec<String> {
        let Some(helper_dir) = &self.helper_dir else {
            return Vec::new();
        };
        if self.profile.kind() != RuntimeKind::Java {
            return Vec::new();
        }
        read_dir_names(helper_dir)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|name| name.strip_suffix(".java").map(str::to_owned))
            .collect()
    }

    fn collect(&self, skip_helper: bool) -> Result<Vec<PlannedCopy>, StagingError> {
        let sources = self.profile.sources_dir(&self.project_dir);
        let helper_target = self
            .helper_dir
            .as_ref()
            .map(|dir| self.profile.helper_destination(&self.project_dir, dir));
        let helper_classes = if skip_helper {
            self.helper_class_stems()
        } else {
            Vec::new()
        };

        let mut planned = Vec::new();
        let walker = WalkDir::new(&sources)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() != 1
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| self.profile.excludes_top_level(name))
            });
        for entry in walker {
            let entry = entry.map_err(|err| StagingError::Io {
                path: sources.clone(),
                message: err.to_string(),
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let source = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()).map_err(|path| {
                StagingError::Io {
                    path: sources.clone(),
                    message: format!("non UTF-8 path {}", path.display()),
                }
            })?;
            if skip_helper && helper_target.as_ref().is_some_and(|target| source.starts_with(target)) {
                continue;
            }
            if source.extension() == Some("class")
                && source
                    .file_stem()
                    .is_some_and(|stem| helper_classes.iter().any(|name| name == stem))
            {
                continue;
            }
            let Ok(relative) = source.strip_prefix(&sources) else {
                continue;
            };
            if let Some(dest) = self.profile.destination(relative) {
                planned.push(PlannedCopy {
                    source,
                    relative: dest,
                    symlink: entry.path_is_symlink(),
                });
            }
        }
        Ok(planned)
    }

    async fn download_ossutil(&self, workspace: &Utf8Path) -> Result<bool, StagingError> {
        let Some(url) = &self.ossutil_url else {
            return Ok(false);
        };
        let download_error = |err: reqwest::Error| StagingError::Download {
            url: url.clone(),
            message: err.to_string(),
        };
        let bytes = reqwest::get(url.as_str())
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_error)?
            .bytes()
            .await
            .map_err(download_error)?;
        let dest = workspace.join(OSSUTIL_FILE_NAME);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|err| StagingError::io(&dest, &err))?;
        make_executable(&dest).await?;
        tracing::info!(url = %url, dest = %dest, "object storage client bundled");
        Ok(true)
    }
}

impl<R> ArtifactStager for WorkspaceStager<R>
where
    R: CommandRunner + Send + Sync,
{
    fn stage<'a>(
        &'a self,
        workspace: &'a Utf8Path,
        ledger: &'a mut ResourceLedger,
    ) -> StageFuture<'a, StagedWorkspace> {
        Box::pin(async move {
            self.inject_helper(ledger)?;
            self.run_steps(&self.profile.prepare_steps(&self.project_dir))?;

            let planned = self.collect(false)?;
            let mut files = copy_planned(&planned, workspace).await?;
            self.run_steps(&self.profile.install_steps(workspace))?;
            if self.download_ossutil(workspace).await? {
                files += 1;
            }
            tracing::info!(workspace = %workspace, files, "workspace staged");
            Ok(StagedWorkspace {
                root: workspace.to_path_buf(),
                files,
            })
        })
    }

    fn copy_user_artifact<'a>(&'a self, dest: &'a Utf8Path) -> StageFuture<'a, usize> {
        Box::pin(async move {
            let planned = self.collect(true)?;
            let files = copy_planned(&planned, dest).await?;
            self.run_steps(&self.profile.install_steps(dest))?;
            tracing::info!(dest = %dest, files, "user artefact copied");
            Ok(files)
        })
    }
}

#[derive(Clone, Debug)]
struct PlannedCopy {
    source: Utf8PathBuf,
    relative: Utf8PathBuf,
    symlink: bool,
}

async fn copy_planned(planned: &[PlannedCopy], dest_root: &Utf8Path) -> Result<usize, StagingError> {
    tokio::fs::create_dir_all(dest_root)
        .await
        .map_err(|err| StagingError::io(dest_root, &err))?;
    try_join_all(planned.iter().map(|copy| async move {
        let dest = dest_root.join(&copy.relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StagingError::io(parent, &err))?;
        }
        copy_entry(copy, &dest).await
    }))
    .await?;
    Ok(planned.len())
}

#[cfg(unix)]
async fn copy_entry(copy: &PlannedCopy, dest: &Utf8Path) -> Result<(), StagingError> {
    if copy.symlink {
        let target = tokio::fs::read_link(&copy.source)
            .await
            .map_err(|err| StagingError::io(&copy.source, &err))?;
        if tokio::fs::symlink_metadata(dest).await.is_ok() {
            tokio::fs::remove_file(dest)
                .await
                .map_err(|err| StagingError::io(dest, &err))?;
        }
        return tokio::fs::symlink(target, dest)
            .await
            .map_err(|err| StagingError::io(dest, &err));
    }
    tokio::fs::copy(&copy.source, dest)
        .await
        .map(|_| ())
        .map_err(|err| StagingError::io(&copy.source, &err))
}

#[cfg(not(unix))]
async fn copy_entry(copy: &PlannedCopy, dest: &Utf8Path) -> Result<(), StagingError> {
    tokio::fs::copy(&copy.source, dest)
        .await
        .map(|_| ())
        .map_err(|err| StagingError::io(&copy.source, &err))
}

#[cfg(unix)]
async fn make_executable(path: &Utf8Path) -> Result<(), StagingError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|err| StagingError::io(path, &err))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Utf8Path) -> Result<(), StagingError> {
    Ok(())
}

fn read_dir_names(dir: &Utf8Path) -> Result<Vec<String>, StagingError> {
    let mut names = Vec::new();
    for entry in dir.read_dir_utf8().map_err(|err| StagingError::io(dir, &err))? {
        let entry = entry.map_err(|err| StagingError::io(dir, &err))?;
        names.push(entry.file_name().to_owned());
    }
    names.sort();
    Ok(names)
}

fn copy_tree(source: &Utf8Path, dest: &Utf8Path) -> Result<(), StagingError> {
    if source.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StagingError::io(parent, &err))?;
        }
        std::fs::copy(source, dest).map_err(|err| StagingError::io(source, &err))?;
        return Ok(());
    }
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|err| StagingError::Io {
            path: source.to_path_buf(),
            message: err.to_string(),
        })?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let Some(relative_utf8) = Utf8Path::from_path(relative) else {
            return Err(StagingError::Io {
                path: source.to_path_buf(),
                message: format!("non UTF-8 path {}", relative.display()),
            });
        };
        let target = dest.join(relative_utf8);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|err| StagingError::io(&target, &err))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|err| StagingError::io(&target, &err))?;
        }
    }
    Ok(())
}
