//! Best-effort teardown of everything a run created.
//!
//! The janitor walks a [`ResourceLedger`] and deletes remote resources in
//! dependency order: aliases, versions, triggers, functions, then the
//! service. Items within a batch are deleted concurrently; batches run one
//! after another. A failed deletion is recorded and the sweep carries on.
//! Uploaded objects, the transient bucket, and local temporary paths follow.

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::future::Future;
use std::io;

use camino::Utf8Path;
use futures::future::join_all;

use crate::ledger::{ResourceLedger, ResourceRef};
use crate::platform::ComputePlatform;
use crate::storage::{ObjectStorage, StorageError};

/// A deletion or listing that failed during cleanup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupFailure {
    /// What was being removed or listed.
    pub resource: String,
    /// Why it failed.
    pub message: String,
}

impl Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

/// Outcome of a cleanup sweep.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    /// Resources confirmed deleted, in the order they completed per batch.
    pub deleted: Vec<ResourceRef>,
    /// Deletions or listings that failed.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Returns `true` when every attempted step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Renders every failure on one line, separated by `; `.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn record<E: Display>(&mut self, resource: ResourceRef, result: Result<(), E>) {
        match result {
            Ok(()) => {
                tracing::info!(%resource, "deleted");
                self.deleted.push(resource);
            }
            Err(err) => self.note(resource.to_string(), &err),
        }
    }

    fn note(&mut self, resource: String, err: &dyn Display) {
        tracing::warn!(%resource, error = %err, "cleanup step failed");
        self.failures.push(CleanupFailure {
            resource,
            message: err.to_string(),
        });
    }
}

/// Deletes ledger entries through the platform and storage collaborators.
#[derive(Debug)]
pub struct Janitor<'a, P, S> {
    platform: &'a P,
    storage: &'a S,
}

impl<'a, P, S> Janitor<'a, P, S>
where
    P: ComputePlatform + Sync,
    S: ObjectStorage,
{
    /// Creates a janitor over the given collaborators.
    #[must_use]
    pub const fn new(platform: &'a P, storage: &'a S) -> Self {
        Self { platform, storage }
    }

    /// Deletes every resource recorded in `ledger`.
    ///
    /// Never fails; failures are collected in the returned report.
    pub async fn sweep(&self, ledger: &ResourceLedger) -> CleanupReport {
        let mut report = CleanupReport::default();
        if let Some(service) = ledger.service() {
            self.sweep_service(service, ledger, &mut report).await;
        }
        self.sweep_storage(ledger, &mut report);
        sweep_local(ledger, &mut report).await;
        report
    }

    async fn sweep_service(&self, service: &str, ledger: &ResourceLedger, report: &mut CleanupReport) {
        let aliases = list_or_note(
            self.platform.list_aliases(service),
            format!("aliases of service {service}"),
            report,
        )
        .await;
        let results = join_all(aliases.iter().map(|alias| async move {
            let resource = ResourceRef::Alias {
                service: service.to_owned(),
                name: alias.clone(),
            };
            (resource, self.platform.delete_alias(service, alias).await)
        }))
        .await;
        absorb(report, results);

        let versions = list_or_note(
            self.platform.list_versions(service),
            format!("versions of service {service}"),
            report,
        )
        .await;
        let results = join_all(versions.iter().map(|version| async move {
            let resource = ResourceRef::Version {
                service: service.to_owned(),
                id: version.clone(),
            };
            (resource, self.platform.delete_version(service, version).await)
        }))
        .await;
        absorb(report, results);

        let mut functions: BTreeSet<String> = list_or_note(
            self.platform.list_functions(service),
            format!("functions of service {service}"),
            report,
        )
        .await
        .into_iter()
        .collect();
        functions.extend(ledger.functions().iter().cloned());

        let triggers = self.collect_triggers(service, &functions, ledger, report).await;
        let results = join_all(triggers.iter().map(|(function, trigger)| async move {
            let resource = ResourceRef::Trigger {
                service: service.to_owned(),
                function: function.clone(),
                name: trigger.clone(),
            };
            (
                resource,
                self.platform.delete_trigger(service, function, trigger).await,
            )
        }))
        .await;
        absorb(report, results);

        let results = join_all(functions.iter().map(|function| async move {
            let resource = ResourceRef::Function {
                service: service.to_owned(),
                name: function.clone(),
            };
            (resource, self.platform.delete_function(service, function).await)
        }))
        .await;
        absorb(report, results);

        let result = self.platform.delete_service(service).await;
        report.record(
            ResourceRef::Service {
                name: service.to_owned(),
            },
            result,
        );
    }

    async fn collect_triggers(
        &self,
        service: &str,
        functions: &BTreeSet<String>,
        ledger: &ResourceLedger,
        report: &mut CleanupReport,
    ) -> BTreeSet<(String, String)> {
        let listed = join_all(functions.iter().map(|function| async move {
            (function, self.platform.list_triggers(service, function).await)
        }))
        .await;

        let mut triggers: BTreeSet<(String, String)> = ledger.triggers().iter().cloned().collect();
        for (function, result) in listed {
            match result {
                Ok(names) => {
                    triggers.extend(names.into_iter().map(|name| (function.clone(), name)));
                }
                Err(err) => report.note(format!("triggers of function {service}/{function}"), &err),
            }
        }
        triggers
    }

    fn sweep_storage(&self, ledger: &ResourceLedger, report: &mut CleanupReport) {
        for (bucket, key) in ledger.objects() {
            let result = self.storage.delete(bucket, key);
            report.record(
                ResourceRef::Object {
                    bucket: bucket.clone(),
                    key: key.clone(),
                },
                result,
            );
        }

        let Some(bucket) = ledger.bucket() else {
            return;
        };
        let resource = ResourceRef::Bucket {
            name: bucket.to_owned(),
        };
        match self.storage.list(bucket) {
            Ok(remaining) if remaining.is_empty() => {
                report.record(resource, self.storage.delete_bucket(bucket));
            }
            Ok(remaining) => report.record(
                resource,
                Err(StorageError::BucketNotEmpty {
                    bucket: bucket.to_owned(),
                    remaining: remaining.len(),
                }),
            ),
            Err(err) => report.record(resource, Err(err)),
        }
    }
}

async fn list_or_note<E: Display>(
    listing: impl Future<Output = Result<Vec<String>, E>>,
    what: String,
    report: &mut CleanupReport,
) -> Vec<String> {
    match listing.await {
        Ok(items) => items,
        Err(err) => {
            report.note(format!("listing {what}"), &err);
            Vec::new()
        }
    }
}

fn absorb<E: Display>(report: &mut CleanupReport, results: Vec<(ResourceRef, Result<(), E>)>) {
    for (resource, result) in results {
        report.record(resource, result);
    }
}

async fn sweep_local(ledger: &ResourceLedger, report: &mut CleanupReport) {
    let results = join_all(ledger.local_paths().iter().map(|path| async move {
        (
            ResourceRef::LocalPath { path: path.clone() },
            remove_local(path).await,
        )
    }))
    .await;
    absorb(report, results);
}

async fn remove_local(path: &Utf8Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests;
