//! Deployable archive creation and result extraction.
//!
//! [`ArchivePackager`] turns a staged workspace into a deflate-compressed zip
//! carrying directories, regular files, and symlinks with their POSIX
//! permission bits. [`extract_tarball`] unpacks the gzip tarball the helper
//! produces into the shared artefact directory.

use std::fs::{self, File};
use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use thiserror::Error;
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Deflate level applied to every archive entry.
pub const COMPRESSION_LEVEL: i64 = 6;

/// Directory names skipped while packaging.
pub const DEFAULT_EXCLUDES: &[&str] = &["__pycache__", ".git"];

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Errors raised while packaging or extracting archives.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Raised when an entry cannot be read from the source tree.
    #[error("failed to read {path}: {message}")]
    Entry {
        /// Entry that could not be read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a symlink points at nothing.
    #[error("symlink {path} points to missing target {target}")]
    BrokenSymlink {
        /// Link location.
        path: String,
        /// Recorded link target.
        target: String,
    },
    /// Raised when a path is not valid UTF-8.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the path.
        path: String,
    },
    /// Raised when the archive cannot be written.
    #[error("failed to write archive {path}: {message}")]
    Write {
        /// Archive destination.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a tarball cannot be unpacked.
    #[error("failed to extract {path}: {message}")]
    Extract {
        /// Tarball being unpacked.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Summary of a packaging run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PackageSummary {
    /// Directory entries written.
    pub directories: usize,
    /// Regular files written.
    pub files: usize,
    /// Symlinks written.
    pub symlinks: usize,
}

/// Builds zip archives from directory trees.
#[derive(Clone, Debug)]
pub struct ArchivePackager {
    excludes: Vec<String>,
}

impl Default for ArchivePackager {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDES.iter().map(|name| (*name).to_owned()))
    }
}

impl ArchivePackager {
    /// Creates a packager that skips any entry whose file name is listed.
    #[must_use]
    pub fn new(excludes: impl IntoIterator<Item = String>) -> Self {
        Self {
            excludes: excludes.into_iter().collect(),
        }
    }

    /// Writes every entry under `root` into a new archive at `dest`.
    ///
    /// Entries are visited in file-name order so repeated runs over the same
    /// tree produce identical archives. Any unreadable entry aborts the run
    /// and the partially written file at `dest` is removed.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] when the tree cannot be walked, an entry
    /// cannot be read, a symlink is dangling, or the archive write fails.
    pub fn package(&self, root: &Utf8Path, dest: &Utf8Path) -> Result<PackageSummary, ArchiveError> {
        self.write_archive(root, dest)
            .inspect_err(|_| discard_partial(dest))
    }

    fn write_archive(
        &self,
        root: &Utf8Path,
        dest: &Utf8Path,
    ) -> Result<PackageSummary, ArchiveError> {
        let write_err = |err: &dyn std::fmt::Display| ArchiveError::Write {
            path: dest.to_string(),
            message: err.to_string(),
        };
        let file = File::create(dest).map_err(|err| write_err(&err))?;
        let mut writer = ZipWriter::new(file);
        let mut summary = PackageSummary::default();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry.file_name()));

        for item in walker {
            let entry = item.map_err(|err| ArchiveError::Entry {
                path: err
                    .path()
                    .map_or_else(|| root.to_string(), |path| path.display().to_string()),
                message: err.to_string(),
            })?;
            let path = utf8_path(entry.path())?;
            let name = archive_name(root, path)?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                let options = entry_options(path, DEFAULT_DIR_MODE)?;
                writer
                    .add_directory(name, options)
                    .map_err(|err| write_err(&err))?;
                summary.directories += 1;
            } else if file_type.is_symlink() {
                let target = link_target(path)?;
                let options = entry_options(path, DEFAULT_FILE_MODE)?;
                writer
                    .add_symlink(name, target, options)
                    .map_err(|err| write_err(&err))?;
                summary.symlinks += 1;
            } else {
                let options = entry_options(path, DEFAULT_FILE_MODE)?;
                let mut source = File::open(path).map_err(|err| entry_err(path, &err))?;
                writer
                    .start_file(name, options)
                    .map_err(|err| write_err(&err))?;
                io::copy(&mut source, &mut writer).map_err(|err| write_err(&err))?;
                summary.files += 1;
            }
        }

        writer.finish().map_err(|err| write_err(&err))?;
        tracing::debug!(
            archive = %dest,
            files = summary.files,
            directories = summary.directories,
            symlinks = summary.symlinks,
            "archive written"
        );
        Ok(summary)
    }

    fn is_excluded(&self, name: &std::ffi::OsStr) -> bool {
        name.to_str()
            .is_some_and(|value| self.excludes.iter().any(|excluded| excluded == value))
    }
}

fn discard_partial(dest: &Utf8Path) {
    match fs::remove_file(dest) {
        Ok(()) => tracing::debug!(archive = %dest, "partial archive removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(archive = %dest, error = %err, "failed to remove partial archive"),
    }
}

/// Unpacks a gzip-compressed tarball into `dest`, creating it as needed.
///
/// # Errors
///
/// Returns [`ArchiveError::Extract`] when the tarball is unreadable or
/// corrupt, or when `dest` cannot be populated.
pub fn extract_tarball(tarball: &Utf8Path, dest: &Utf8Path) -> Result<(), ArchiveError> {
    let extract_err = |err: io::Error| ArchiveError::Extract {
        path: tarball.to_string(),
        message: err.to_string(),
    };
    fs::create_dir_all(dest).map_err(extract_err)?;
    let file = File::open(tarball).map_err(extract_err)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(dest).map_err(extract_err)?;
    tracing::info!(tarball = %tarball, dest = %dest, "acceleration archive extracted");
    Ok(())
}

/// Rewrites an absolute link target as a forward-slash path relative to the
/// directory holding the link. Relative targets only have their separators
/// normalised.
#[must_use]
pub fn portable_link_target(link_dir: &Utf8Path, target: &str) -> String {
    if !Utf8Path::new(target).is_absolute() {
        return target.replace('\\', "/");
    }

    let base: Vec<Utf8Component<'_>> = link_dir.components().collect();
    let dest: Vec<Utf8Component<'_>> = Utf8Path::new(target).components().collect();
    let shared = base
        .iter()
        .zip(dest.iter())
        .take_while(|(left, right)| left == right)
        .count();

    let mut parts: Vec<String> = base
        .iter()
        .skip(shared)
        .map(|_| String::from(".."))
        .collect();
    parts.extend(
        dest.iter()
            .skip(shared)
            .map(|component| component.as_str().replace('\\', "/")),
    );
    parts.join("/")
}

fn link_target(path: &Utf8Path) -> Result<String, ArchiveError> {
    let raw = fs::read_link(path).map_err(|err| entry_err(path, &err))?;
    let target = utf8_path(&raw)?.to_owned();
    if fs::metadata(path).is_err() {
        return Err(ArchiveError::BrokenSymlink {
            path: path.to_string(),
            target: target.to_string(),
        });
    }

    if cfg!(windows) {
        let parent = path.parent().unwrap_or(path);
        Ok(portable_link_target(parent, target.as_str()))
    } else {
        Ok(target.into_string())
    }
}

fn archive_name(root: &Utf8Path, path: &Utf8Path) -> Result<String, ArchiveError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|err| entry_err(path, &err))?;
    Ok(relative
        .components()
        .map(|component| component.as_str())
        .collect::<Vec<_>>()
        .join("/"))
}

fn entry_options(path: &Utf8Path, fallback: u32) -> Result<SimpleFileOptions, ArchiveError> {
    let metadata = fs::symlink_metadata(path).map_err(|err| entry_err(path, &err))?;
    Ok(SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .unix_permissions(permission_bits(&metadata, fallback)))
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata, _fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata, fallback: u32) -> u32 {
    if metadata.permissions().readonly() {
        fallback & 0o555
    } else {
        fallback
    }
}

fn utf8_path(path: &std::path::Path) -> Result<&Utf8Path, ArchiveError> {
    Utf8Path::from_path(path).ok_or_else(|| ArchiveError::NonUtf8Path {
        path: path.display().to_string(),
    })
}

fn entry_err(path: &Utf8Path, err: &dyn std::fmt::Display) -> ArchiveError {
    ArchiveError::Entry {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Reads an archive file fully, for callers that inline it into a request.
///
/// # Errors
///
/// Returns [`ArchiveError::Entry`] when the file cannot be read.
pub fn read_archive(path: &Utf8Path) -> Result<Vec<u8>, ArchiveError> {
    fs::read(path).map_err(|err| entry_err(path, &err))
}

/// Returns the archive path that sits beside a workspace directory.
#[must_use]
pub fn sibling_archive_path(workspace: &Utf8Path) -> Utf8PathBuf {
    let mut path = workspace.to_owned();
    path.set_extension("zip");
    path
}

#[cfg(test)]
mod tests;
