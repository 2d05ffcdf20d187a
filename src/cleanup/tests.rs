//! Unit tests for the cleanup sweep.

use super::*;
use crate::test_support::{MemoryStorage, RecordingPlatform};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const SERVICE: &str = "trace-dump-service-1";
const FUNCTION: &str = "trace-dump-func-1";
const TRIGGER: &str = "trace-dump-trigger-1";
const BUCKET: &str = "tmp-acceleration-1";

#[fixture]
fn platform() -> RecordingPlatform {
    let platform = RecordingPlatform::new();
    platform.seed_service(SERVICE);
    platform.seed_function(SERVICE, FUNCTION);
    platform.seed_trigger(SERVICE, FUNCTION, TRIGGER);
    platform
}

#[fixture]
fn ledger() -> ResourceLedger {
    let mut ledger = ResourceLedger::new();
    ledger.record_service(SERVICE);
    ledger.record_function(FUNCTION);
    ledger.record_trigger(FUNCTION, TRIGGER);
    ledger
}

fn position(calls: &[String], wanted: &str) -> usize {
    calls
        .iter()
        .position(|call| call == wanted)
        .unwrap_or_else(|| panic!("missing call {wanted:?} in {calls:?}"))
}

#[rstest]
#[tokio::test]
async fn every_recorded_resource_is_deleted_once(platform: RecordingPlatform, ledger: ResourceLedger) {
    let storage = MemoryStorage::new();

    let report = Janitor::new(&platform, &storage).sweep(&ledger).await;

    assert!(report.is_clean(), "failures: {}", report.failure_summary());
    assert!(platform.live_resources().is_empty());
    for operation in ["delete_trigger", "delete_function", "delete_service"] {
        assert_eq!(platform.calls_to(operation).len(), 1, "{operation}");
    }
    let rendered: Vec<String> = report.deleted.iter().map(ToString::to_string).collect();
    assert_eq!(
        rendered,
        vec![
            format!("trigger {SERVICE}/{FUNCTION}/{TRIGGER}"),
            format!("function {SERVICE}/{FUNCTION}"),
            format!("service {SERVICE}"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn published_aliases_and_versions_go_first(platform: RecordingPlatform, ledger: ResourceLedger) {
    platform.seed_alias(SERVICE, "prod");
    platform.seed_version(SERVICE, "1");
    platform.seed_version(SERVICE, "2");
    let storage = MemoryStorage::new();

    let report = Janitor::new(&platform, &storage).sweep(&ledger).await;

    assert!(report.is_clean(), "failures: {}", report.failure_summary());
    let calls = platform.calls();
    let alias = position(&calls, &format!("delete_alias {SERVICE}/prod"));
    let version = position(&calls, &format!("delete_version {SERVICE}/1"));
    let trigger = position(&calls, &format!("delete_trigger {SERVICE}/{FUNCTION}/{TRIGGER}"));
    let function = position(&calls, &format!("delete_function {SERVICE}/{FUNCTION}"));
    let service = position(&calls, &format!("delete_service {SERVICE}"));
    assert!(alias < version && version < trigger && trigger < function && function < service);
    assert_eq!(platform.calls_to("delete_version").len(), 2);
}

#[rstest]
#[tokio::test]
async fn unlisted_ledger_entries_are_still_attempted(ledger: ResourceLedger) {
    let platform = RecordingPlatform::new().failing("list_functions");
    platform.seed_service(SERVICE);
    platform.seed_function(SERVICE, FUNCTION);
    let storage = MemoryStorage::new();

    let report = Janitor::new(&platform, &storage).sweep(&ledger).await;

    assert_eq!(platform.calls_to("delete_function").len(), 1);
    assert_eq!(platform.calls_to("delete_trigger").len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert!(
        report.failure_summary().starts_with(&format!("listing functions of service {SERVICE}")),
        "summary: {}",
        report.failure_summary()
    );
}

#[rstest]
#[tokio::test]
async fn failed_deletions_do_not_stop_the_sweep(ledger: ResourceLedger) {
    let platform = RecordingPlatform::new().failing("delete_trigger");
    platform.seed_service(SERVICE);
    platform.seed_function(SERVICE, FUNCTION);
    platform.seed_trigger(SERVICE, FUNCTION, TRIGGER);
    let storage = MemoryStorage::new().with_bucket(BUCKET);
    let mut with_bucket = ledger;
    with_bucket.record_bucket(BUCKET);

    let report = Janitor::new(&platform, &storage).sweep(&with_bucket).await;

    assert_eq!(platform.calls_to("delete_function").len(), 1);
    assert_eq!(platform.calls_to("delete_service").len(), 1);
    let failed: Vec<&str> = report
        .failures
        .iter()
        .map(|failure| failure.resource.as_str())
        .collect();
    assert_eq!(
        failed,
        vec![
            format!("trigger {SERVICE}/{FUNCTION}/{TRIGGER}").as_str(),
            format!("function {SERVICE}/{FUNCTION}").as_str(),
            format!("service {SERVICE}").as_str(),
        ]
    );
    assert!(storage.buckets().is_empty(), "bucket sweep still ran");
}

#[rstest]
#[tokio::test]
async fn objects_are_removed_before_their_bucket() {
    let platform = RecordingPlatform::new();
    let storage = MemoryStorage::new().with_bucket(BUCKET);
    storage.insert(BUCKET, "tmp-func.zip", b"zip".to_vec());
    storage.insert(BUCKET, "srctl.tar.gz", b"tar".to_vec());
    let mut ledger = ResourceLedger::new();
    ledger.record_bucket(BUCKET);
    ledger.record_object(BUCKET, "tmp-func.zip");
    ledger.record_object(BUCKET, "srctl.tar.gz");

    let report = Janitor::new(&platform, &storage).sweep(&ledger).await;

    assert!(report.is_clean(), "failures: {}", report.failure_summary());
    assert!(storage.buckets().is_empty());
    assert!(platform.calls().is_empty(), "no service was recorded");
    assert_eq!(
        storage.calls().last().map(String::as_str),
        Some(format!("delete_bucket {BUCKET}").as_str())
    );
}

#[rstest]
#[tokio::test]
async fn non_empty_bucket_is_reported_not_forced() {
    let platform = RecordingPlatform::new();
    let storage = MemoryStorage::new().with_bucket(BUCKET);
    storage.insert(BUCKET, "someone-elses.txt", b"x".to_vec());
    let mut ledger = ResourceLedger::new();
    ledger.record_bucket(BUCKET);

    let report = Janitor::new(&platform, &storage).sweep(&ledger).await;

    assert_eq!(storage.buckets(), vec![String::from(BUCKET)]);
    assert_eq!(report.failures.len(), 1);
    assert!(
        report.failure_summary().contains("is not empty: 1 object(s) remain"),
        "summary: {}",
        report.failure_summary()
    );
}

#[rstest]
#[tokio::test]
async fn local_paths_are_removed_and_missing_ones_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
    let workspace = root.join("trace-dump-tmp-1");
    std::fs::create_dir_all(workspace.join("nested")).expect("mkdir");
    std::fs::write(workspace.join("nested/file"), "x").expect("write");
    let archive = root.join("trace-dump-tmp-1.zip");
    std::fs::write(&archive, "zip").expect("write zip");
    let mut ledger = ResourceLedger::new();
    ledger.record_local_path(workspace.clone());
    ledger.record_local_path(archive.clone());
    ledger.record_local_path(root.join("never-created"));

    let report = Janitor::new(&RecordingPlatform::new(), &MemoryStorage::new())
        .sweep(&ledger)
        .await;

    assert!(report.is_clean(), "failures: {}", report.failure_summary());
    assert!(!workspace.exists());
    assert!(!archive.exists());
    assert_eq!(report.deleted.len(), 3);
}

#[test]
fn failure_summary_joins_every_failure() {
    let report = CleanupReport {
        deleted: Vec::new(),
        failures: vec![
            CleanupFailure {
                resource: String::from("service a"),
                message: String::from("boom"),
            },
            CleanupFailure {
                resource: String::from("bucket b"),
                message: String::from("denied"),
            },
        ],
    };

    assert!(!report.is_clean());
    assert_eq!(report.failure_summary(), "service a: boom; bucket b: denied");
}
