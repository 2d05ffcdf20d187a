//! Record of everything a run created that cleanup must remove.
//!
//! Every creation step appends to the [`ResourceLedger`] as soon as the
//! platform confirms the resource exists, before the next step starts. The
//! cleanup phase walks the ledger rather than relying on control flow.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

/// A single resource referenced by the ledger or the cleanup report.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ResourceRef {
    /// Service alias.
    Alias {
        /// Owning service.
        service: String,
        /// Alias name.
        name: String,
    },
    /// Published service version.
    Version {
        /// Owning service.
        service: String,
        /// Version identifier.
        id: String,
    },
    /// Function trigger.
    Trigger {
        /// Owning service.
        service: String,
        /// Owning function.
        function: String,
        /// Trigger name.
        name: String,
    },
    /// Function.
    Function {
        /// Owning service.
        service: String,
        /// Function name.
        name: String,
    },
    /// Service.
    Service {
        /// Service name.
        name: String,
    },
    /// Object in a bucket.
    Object {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// Bucket.
    Bucket {
        /// Bucket name.
        name: String,
    },
    /// Local file or directory.
    LocalPath {
        /// Path on disk.
        path: Utf8PathBuf,
    },
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alias { service, name } => write!(f, "alias {service}/{name}"),
            Self::Version { service, id } => write!(f, "version {service}/{id}"),
            Self::Trigger {
                service,
                function,
                name,
            } => write!(f, "trigger {service}/{function}/{name}"),
            Self::Function { service, name } => write!(f, "function {service}/{name}"),
            Self::Service { name } => write!(f, "service {name}"),
            Self::Object { bucket, key } => write!(f, "object oss://{bucket}/{key}"),
            Self::Bucket { name } => write!(f, "bucket {name}"),
            Self::LocalPath { path } => write!(f, "local path {path}"),
        }
    }
}

/// Resources created during one pipeline run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceLedger {
    service: Option<String>,
    functions: Vec<String>,
    triggers: Vec<(String, String)>,
    bucket: Option<String>,
    objects: Vec<(String, String)>,
    local_paths: Vec<Utf8PathBuf>,
}

impl ResourceLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the created service.
    pub fn record_service(&mut self, name: impl Into<String>) {
        self.service = Some(name.into());
    }

    /// Records a created function.
    pub fn record_function(&mut self, name: impl Into<String>) {
        push_unique(&mut self.functions, name.into());
    }

    /// Records a created trigger on `function`.
    pub fn record_trigger(&mut self, function: impl Into<String>, name: impl Into<String>) {
        push_unique(&mut self.triggers, (function.into(), name.into()));
    }

    /// Records a bucket this run created.
    pub fn record_bucket(&mut self, name: impl Into<String>) {
        self.bucket = Some(name.into());
    }

    /// Records an object this run uploaded.
    pub fn record_object(&mut self, bucket: impl Into<String>, key: impl Into<String>) {
        push_unique(&mut self.objects, (bucket.into(), key.into()));
    }

    /// Records a local path to delete during cleanup.
    pub fn record_local_path(&mut self, path: impl Into<Utf8PathBuf>) {
        push_unique(&mut self.local_paths, path.into());
    }

    /// Removes an object that was already deleted outside cleanup.
    pub fn discharge_object(&mut self, bucket: &str, key: &str) {
        self.objects
            .retain(|(existing_bucket, existing_key)| existing_bucket != bucket || existing_key != key);
    }

    /// Removes a local path that was already deleted outside cleanup.
    pub fn discharge_local_path(&mut self, path: &Utf8Path) {
        self.local_paths.retain(|existing| existing != path);
    }

    /// Service created by this run, if any.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Functions created by this run.
    #[must_use]
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Triggers created by this run, as `(function, trigger)` pairs.
    #[must_use]
    pub fn triggers(&self) -> &[(String, String)] {
        &self.triggers
    }

    /// Bucket created by this run, if any.
    #[must_use]
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Objects uploaded by this run, as `(bucket, key)` pairs.
    #[must_use]
    pub fn objects(&self) -> &[(String, String)] {
        &self.objects
    }

    /// Local paths to delete.
    #[must_use]
    pub fn local_paths(&self) -> &[Utf8PathBuf] {
        &self.local_paths
    }

    /// Returns `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.service.is_none()
            && self.functions.is_empty()
            && self.triggers.is_empty()
            && self.bucket.is_none()
            && self.objects.is_empty()
            && self.local_paths.is_empty()
    }

    /// Lists every recorded resource.
    #[must_use]
    pub fn entries(&self) -> Vec<ResourceRef> {
        let mut entries = Vec::new();
        if let Some(service) = &self.service {
            entries.extend(self.triggers.iter().map(|(function, name)| {
                ResourceRef::Trigger {
                    service: service.clone(),
                    function: function.clone(),
                    name: name.clone(),
                }
            }));
            entries.extend(self.functions.iter().map(|name| ResourceRef::Function {
                service: service.clone(),
                name: name.clone(),
            }));
            entries.push(ResourceRef::Service {
                name: service.clone(),
            });
        }
        entries.extend(self.objects.iter().map(|(bucket, key)| ResourceRef::Object {
            bucket: bucket.clone(),
            key: key.clone(),
        }));
        if let Some(bucket) = &self.bucket {
            entries.push(ResourceRef::Bucket {
                name: bucket.clone(),
            });
        }
        entries.extend(
            self.local_paths
                .iter()
                .map(|path| ResourceRef::LocalPath { path: path.clone() }),
        );
        entries
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}
