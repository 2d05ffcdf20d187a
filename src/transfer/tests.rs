//! Unit tests for the chunked transfer client.

use super::*;
use crate::test_support::ScriptedChannel;
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

struct Destination {
    _dir: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn destination() -> Destination {
    let dir = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("srctl.tar.gz")).expect("utf8 path");
    Destination { _dir: dir, path }
}

fn payload(len: u64) -> Vec<u8> {
    (0..len)
        .map(|index| u8::try_from(index % 251).expect("below 251"))
        .collect()
}

#[rstest]
#[tokio::test]
async fn ten_mebibytes_arrive_in_four_ranges(destination: Destination) {
    let data = payload(10 * MIB);
    let channel = ScriptedChannel::serving(data.clone());

    let written = ChunkedDownloader::new(3 * MIB)
        .download(&channel, "/tmp/srctl.tar.gz", &destination.path)
        .await
        .expect("download");

    assert_eq!(written, 10 * MIB);
    assert_eq!(
        channel.ranges(),
        vec![
            (0, 3_145_728),
            (3_145_728, 3_145_728),
            (6_291_456, 3_145_728),
            (9_437_184, 1_048_576),
        ]
    );
    let on_disk = std::fs::read(&destination.path).expect("read download");
    assert_eq!(on_disk, data);
}

#[rstest]
#[case(0, 3, 0)]
#[case(1, 3, 1)]
#[case(3, 3, 1)]
#[case(4, 3, 2)]
#[case(9, 3, 3)]
#[case(10, 1, 10)]
#[tokio::test]
async fn range_count_is_the_ceiling_of_size_over_chunk(
    #[case] size: u64,
    #[case] chunk: u64,
    #[case] expected_ranges: usize,
) {
    let channel = ScriptedChannel::serving(payload(size));

    let bytes = ChunkedDownloader::new(chunk)
        .fetch(&channel, "/tmp/srctl.tar.gz")
        .await
        .expect("fetch");

    assert_eq!(channel.ranges().len(), expected_ranges);
    assert_eq!(u64::try_from(bytes.len()).expect("fits"), size);
}

#[rstest]
#[tokio::test]
async fn size_query_precedes_ranges_and_names_the_file() {
    let channel = ScriptedChannel::serving(payload(4));

    ChunkedDownloader::new(2)
        .fetch(&channel, "/mnt/share/srctl.tar.gz")
        .await
        .expect("fetch");

    let requests = channel.requests();
    assert_eq!(
        requests.first(),
        Some(&HelperCommand::Size {
            file: String::from("/mnt/share/srctl.tar.gz")
        })
    );
    assert_eq!(requests.len(), 3);
}

#[rstest]
#[tokio::test]
async fn short_chunk_fails_without_writing(destination: Destination) {
    let channel = ScriptedChannel::serving(payload(8)).truncating_at(4);

    let err = ChunkedDownloader::new(4)
        .download(&channel, "/tmp/srctl.tar.gz", &destination.path)
        .await
        .expect_err("mismatch should fail");

    assert!(matches!(
        err,
        TransferError::ChunkLengthMismatch {
            offset: 4,
            expected: 4,
            actual: 3
        }
    ));
    assert!(!destination.path.exists());
}

#[rstest]
#[tokio::test]
async fn channel_failure_aborts_the_transfer(destination: Destination) {
    let channel = ScriptedChannel::serving(payload(8)).failing_at(4);

    let err = ChunkedDownloader::new(4)
        .download(&channel, "/tmp/srctl.tar.gz", &destination.path)
        .await
        .expect_err("channel failure should abort");

    assert!(matches!(err, TransferError::Channel { .. }));
    assert_eq!(channel.ranges().len(), 2);
    assert!(!destination.path.exists());
}

#[rstest]
#[case("")]
#[case("-1")]
#[case("ten")]
#[case("12 bytes")]
#[case("+10")]
#[case("18446744073709551616")]
#[tokio::test]
async fn malformed_size_is_rejected(#[case] body: &str) {
    let channel = ScriptedChannel::serving(Vec::new()).with_size_response(body);

    let err = ChunkedDownloader::default()
        .fetch(&channel, "/tmp/srctl.tar.gz")
        .await
        .expect_err("size should be rejected");

    assert!(matches!(err, TransferError::InvalidSize { .. }));
    assert!(channel.ranges().is_empty());
}

#[rstest]
#[tokio::test]
async fn enormous_size_requests_one_range_before_failing() {
    let channel = ScriptedChannel::serving(payload(8)).with_size_response(u64::MAX.to_string());

    let err = ChunkedDownloader::new(3 * MIB)
        .fetch(&channel, "/tmp/srctl.tar.gz")
        .await
        .expect_err("short chunk should fail");

    assert!(matches!(
        err,
        TransferError::ChunkLengthMismatch {
            offset: 0,
            expected,
            actual: 8
        } if expected == 3 * MIB
    ));
    assert_eq!(channel.ranges(), vec![(0, 3 * MIB)]);
}

#[test]
fn size_response_whitespace_is_ignored() {
    assert_eq!(parse_size(" 42\n").expect("size"), 42);
}

#[test]
fn zero_chunk_size_is_rejected() {
    assert!(matches!(
        TransferSession::new(10, 0),
        Err(TransferError::InvalidChunkSize)
    ));
}

#[test]
fn session_advances_by_logical_length_until_complete() {
    let mut session = TransferSession::new(5, 2).expect("session");
    let mut offsets = Vec::new();
    while let Some(range) = session.next_range() {
        offsets.push((range.offset, range.length));
        let chunk = vec![0_u8; usize::try_from(range.length).expect("fits")];
        session.accept(range, &chunk).expect("accept");
    }

    assert_eq!(offsets, vec![(0, 2), (2, 2), (4, 1)]);
    assert!(session.is_complete());
    assert_eq!(session.transferred(), session.total());
    assert_eq!(session.into_bytes().len(), 5);
}
