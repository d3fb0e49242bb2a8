use memoexec::cas::{CasClient, TransferFailure, TransferPath, UploadOutcome};
use memoexec::config::CasConfig;
use memoexec::error::{Code, RetryConfig};
use memoexec::fake::{CasOp, FakeServer};
use memoexec::transport::Transport;
use memoexec::{build_tree, Blob, Digest, InputSpec, MemoExecError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Batches hold at most 64 bytes and streams move 32 bytes per chunk.
fn small_limits() -> CasConfig {
    CasConfig {
        max_batch_bytes: 64,
        max_batch_blobs: 4,
        stream_chunk_size: 32,
        max_find_missing_batch: 3,
        max_concurrent_transfers: 2,
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
    }
}

fn setup() -> (Arc<FakeServer>, CasClient) {
    let server = Arc::new(FakeServer::new());
    let transport: Arc<dyn Transport> = server.clone();
    let client = CasClient::new(transport, small_limits(), fast_retry());
    (server, client)
}

fn blob_map(blobs: impl IntoIterator<Item = Blob>) -> HashMap<Digest, Blob> {
    blobs.into_iter().map(|b| (b.digest().clone(), b)).collect()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_large_blob_streams_while_small_ones_batch() {
    let (server, client) = setup();
    let large = Blob::from_bytes(patterned(200));
    let small: Vec<Blob> = (0..6).map(|i| Blob::from_bytes(format!("small-{}", i))).collect();
    let blobs = blob_map(small.iter().cloned().chain([large.clone()]));

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(
        report.outcomes[large.digest()],
        UploadOutcome::Uploaded(TransferPath::Stream)
    );
    for blob in &small {
        assert_eq!(
            report.outcomes[blob.digest()],
            UploadOutcome::Uploaded(TransferPath::Batch)
        );
        assert!(server.cas.contains(blob.digest()));
    }
    assert_eq!(report.stream_uploads, 1);
    // Six 7-byte blobs with a four-blob ceiling need two batches.
    assert_eq!(report.batch_requests, 2);

    let stats = server.cas.stats();
    assert_eq!(stats.write_requests, 7);
    assert_eq!(server.cas.get(large.digest()).unwrap(), patterned(200));
    assert_eq!(report.bytes_uploaded, stats.bytes_received);
}

#[tokio::test]
async fn test_second_upload_transfers_nothing() {
    let (server, client) = setup();
    let blobs = blob_map([
        Blob::from_bytes("alpha"),
        Blob::from_bytes("beta"),
        Blob::from_bytes(patterned(100)),
    ]);
    let cancel = CancellationToken::new();

    client.upload(&blobs, &cancel).await.unwrap();
    let before = server.cas.stats();

    let again = client.upload(&blobs, &cancel).await.unwrap();
    assert!(again
        .outcomes
        .values()
        .all(|o| *o == UploadOutcome::AlreadyPresent));
    assert_eq!(again.bytes_uploaded, 0);
    assert_eq!(again.batch_requests, 0);

    let after = server.cas.stats();
    assert_eq!(after.bytes_received, before.bytes_received);
    assert_eq!(after.batch_update_requests, before.batch_update_requests);
    assert_eq!(after.write_requests, before.write_requests);
}

#[tokio::test]
async fn test_empty_digest_is_never_queried_or_sent() {
    let (server, client) = setup();
    let blobs = blob_map([Blob::from_bytes(Vec::new())]);

    let missing = client
        .find_missing(blobs.keys(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(missing.is_empty());

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        report.outcomes[&Digest::empty()],
        UploadOutcome::AlreadyPresent
    );
    let stats = server.cas.stats();
    assert_eq!(stats.find_missing_requests, 0);
    assert_eq!(stats.batch_update_requests, 0);
}

#[tokio::test]
async fn test_find_missing_splits_large_queries() {
    let (server, client) = setup();
    let stored = server.cas.put(b"stored");
    let mut digests = vec![stored.clone()];
    digests.extend((0..6).map(|i| Digest::of_bytes(format!("absent-{}", i).as_bytes())));

    let missing = client
        .find_missing(&digests, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(missing.len(), 6);
    assert!(!missing.contains(&stored));
    // Seven digests at three per query.
    assert_eq!(server.cas.stats().find_missing_requests, 3);
}

#[tokio::test]
async fn test_partial_rejection_is_reported_per_digest() {
    let (server, client) = setup();
    let good = Blob::from_bytes("good");
    let bad = Blob::from_bytes("bad");
    server.cas.reject(bad.digest().clone(), Code::PermissionDenied);
    let blobs = blob_map([good.clone(), bad.clone()]);

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.failed(), vec![bad.digest()]);
    assert_eq!(
        report.outcomes[good.digest()],
        UploadOutcome::Uploaded(TransferPath::Batch)
    );
    match &report.outcomes[bad.digest()] {
        UploadOutcome::Failed(TransferFailure::Rejected(status)) => {
            assert_eq!(status.code, Code::PermissionDenied)
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(server.cas.contains(good.digest()));
    assert!(!server.cas.contains(bad.digest()));

    let err = report.ensure_complete().unwrap_err();
    assert!(matches!(err, MemoExecError::IncompleteUpload { failed: 1, total: 2 }));
}

#[tokio::test]
async fn test_transient_digest_status_is_resent() {
    let (server, client) = setup();
    let flaky = Blob::from_bytes("flaky");
    let steady = Blob::from_bytes("steady");
    server
        .cas
        .reject_times(flaky.digest().clone(), Code::ResourceExhausted, 1);
    let blobs = blob_map([flaky.clone(), steady.clone()]);

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.batch_requests, 2);
    assert_eq!(server.cas.write_count(flaky.digest()), 1);
    // Only the rejected digest goes out again.
    assert_eq!(server.cas.write_count(steady.digest()), 1);
}

#[tokio::test]
async fn test_transient_batch_failure_is_retried() {
    let (server, client) = setup();
    server.cas.fail_next(CasOp::BatchUpdate, 2, Code::Unavailable);
    let blobs = blob_map([Blob::from_bytes("one"), Blob::from_bytes("two")]);

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(server.cas.stats().batch_update_requests, 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_blobs() {
    let (server, client) = setup();
    server.cas.fail_next(CasOp::BatchUpdate, 10, Code::Unavailable);
    let blob = Blob::from_bytes("never lands");
    let blobs = blob_map([blob.clone()]);

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    match &report.outcomes[blob.digest()] {
        UploadOutcome::Failed(TransferFailure::Transport { error, attempts }) => {
            assert_eq!(error.code, Code::Unavailable);
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(server.cas.stats().batch_update_requests, 3);
}

#[tokio::test]
async fn test_stream_resumes_after_broken_write() {
    let (server, client) = setup();
    // Two chunks land, then the third write fails once.
    server.cas.fail_after(CasOp::Write, 2, 1, Code::Unavailable);
    let large = Blob::from_bytes(patterned(200));
    let blobs = blob_map([large.clone()]);

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(server.cas.get(large.digest()).unwrap(), patterned(200));
    // Seven chunks plus the failed attempt; nothing before the break is resent.
    assert_eq!(server.cas.stats().write_requests, 8);
    assert_eq!(report.bytes_uploaded, 200);
}

#[tokio::test]
async fn test_stream_of_changed_file_is_an_integrity_failure() {
    let (server, client) = setup();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.bin"), patterned(200)).unwrap();
    let spec = InputSpec {
        inputs: vec!["big.bin".to_string()],
        ..Default::default()
    };
    let tree = build_tree(dir.path(), &spec).unwrap();
    let original = Digest::of_bytes(&patterned(200));

    std::fs::write(dir.path().join("big.bin"), vec![0u8; 200]).unwrap();
    let report = client.upload(&tree.blobs, &CancellationToken::new()).await.unwrap();
    match &report.outcomes[&original] {
        UploadOutcome::Failed(TransferFailure::Integrity { actual }) => {
            assert_eq!(*actual, Digest::of_bytes(&[0u8; 200]));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!server.cas.contains(&original));
    assert!(server.cas.contains(&tree.root_digest));
}

#[tokio::test]
async fn test_download_round_trip_mixed_sizes() {
    let (server, client) = setup();
    let small = server.cas.put(b"tiny");
    let large = server.cas.put(&patterned(150));
    let empty = Digest::empty();

    let blobs = client
        .download([&small, &large, &empty], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(blobs.len(), 3);
    assert_eq!(blobs[&small].read_all().unwrap(), b"tiny");
    assert_eq!(blobs[&large].read_all().unwrap(), patterned(150));
    assert!(blobs[&empty].read_all().unwrap().is_empty());

    let stats = server.cas.stats();
    assert_eq!(stats.batch_read_requests, 1);
    assert_eq!(stats.read_requests, 5);
}

#[tokio::test]
async fn test_corrupted_download_is_rejected() {
    let (server, client) = setup();
    let digest = server.cas.put(b"precious");
    server.cas.corrupt(digest.clone());

    let err = client
        .download([&digest], &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        MemoExecError::CasIntegrityFailure { expected, .. } => assert_eq!(expected, digest),
        other => panic!("unexpected error {:?}", other),
    }
    // Integrity failures are not retried.
    assert_eq!(server.cas.read_count(&digest), 1);
}

#[tokio::test]
async fn test_missing_download_is_terminal() {
    let (server, client) = setup();
    let absent = Digest::of_bytes(b"absent");

    let err = client
        .download([&absent], &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        MemoExecError::Transport { source, .. } => assert_eq!(source.code, Code::NotFound),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(server.cas.stats().batch_read_requests, 1);
}

#[tokio::test]
async fn test_blob_filed_under_wrong_key_is_not_uploaded() {
    let (server, client) = setup();
    let claimed = Digest::of_bytes(b"what the caller claims");
    let blob = Blob::from_bytes("actual content");
    let good = Blob::from_bytes("fine");
    let mut blobs = blob_map([good.clone()]);
    blobs.insert(claimed.clone(), blob.clone());

    let report = client.upload(&blobs, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        report.outcomes[&claimed],
        UploadOutcome::Failed(TransferFailure::Integrity {
            actual: blob.digest().clone()
        })
    );
    assert!(!report.outcomes.contains_key(blob.digest()));
    assert_eq!(
        report.outcomes[good.digest()],
        UploadOutcome::Uploaded(TransferPath::Batch)
    );
    assert!(!report.is_complete());
    assert!(!server.cas.contains(&claimed));
    assert!(!server.cas.contains(blob.digest()));
    assert!(report.ensure_complete().is_err());
}

#[tokio::test]
async fn test_batch_read_retries_deadline_exceeded() {
    let (server, client) = setup();
    let digest = server.cas.put(b"tiny");
    server.cas.fail_next(CasOp::BatchRead, 2, Code::DeadlineExceeded);

    let blobs = client
        .download([&digest], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(blobs[&digest].read_all().unwrap(), b"tiny");
    assert_eq!(server.cas.stats().batch_read_requests, 3);
}

#[tokio::test]
async fn test_stream_read_retries_unavailable() {
    let (server, client) = setup();
    let digest = server.cas.put(&patterned(150));
    server.cas.fail_next(CasOp::Read, 1, Code::Unavailable);

    let blobs = client
        .download([&digest], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(blobs[&digest].read_all().unwrap(), patterned(150));
    // Five chunks plus the one failed attempt.
    assert_eq!(server.cas.stats().read_requests, 6);
}

#[tokio::test]
async fn test_huge_claimed_size_fails_without_allocating_it() {
    let (server, client) = setup();
    let real = Digest::of_bytes(b"short");
    let claimed = Digest::new(real.hash(), 1 << 50).unwrap();
    server.cas.put_unverified(claimed.clone(), b"short");

    let err = client
        .download([&claimed], &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        MemoExecError::CasIntegrityFailure { expected, actual } => {
            assert_eq!(expected, claimed);
            assert_eq!(actual, real);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_longer_than_claimed_is_rejected() {
    let (server, client) = setup();
    let data = patterned(150);
    let claimed = Digest::new(Digest::of_bytes(&data).hash(), 100).unwrap();
    server.cas.put_unverified(claimed.clone(), &data);

    let err = client
        .download([&claimed], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoExecError::CasIntegrityFailure { .. }));
    // Reading stops at the first chunk that passes the claimed size.
    assert_eq!(server.cas.stats().read_requests, 4);
}

#[tokio::test]
async fn test_cancelled_upload_returns_cancelled() {
    let (server, client) = setup();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let blobs = blob_map([Blob::from_bytes("late")]);

    let err = client.upload(&blobs, &cancel).await.unwrap_err();
    assert!(matches!(err, MemoExecError::Cancelled));
    assert_eq!(server.cas.blob_count(), 0);
}

#[tokio::test]
async fn test_concurrent_uploads_share_one_client() {
    let (server, client) = setup();
    let cancel = CancellationToken::new();
    let uploads = (0..8).map(|i| {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let blobs = blob_map([
                Blob::from_bytes("shared"),
                Blob::from_bytes(format!("own-{}", i)),
            ]);
            client.upload(&blobs, &cancel).await
        })
    });

    for handle in futures::future::join_all(uploads).await {
        assert!(handle.unwrap().unwrap().is_complete());
    }
    assert_eq!(server.cas.blob_count(), 9);
}

#[tokio::test]
async fn test_acknowledged_digests_download_identically() {
    let (_server, client) = setup();
    let blobs = blob_map([
        Blob::from_bytes("a"),
        Blob::from_bytes(patterned(90)),
        Blob::from_bytes(patterned(300)),
        Blob::from_bytes(Vec::new()),
    ]);
    let cancel = CancellationToken::new();

    let report = client.upload(&blobs, &cancel).await.unwrap();
    let acknowledged = report.acknowledged();
    assert_eq!(acknowledged.len(), blobs.len());

    let downloaded = client.download(acknowledged, &cancel).await.unwrap();
    for (digest, blob) in &blobs {
        assert_eq!(
            downloaded[digest].read_all().unwrap(),
            blob.read_all().unwrap()
        );
    }
    assert!(client.find_missing(blobs.keys(), &cancel).await.unwrap().is_empty());
}
