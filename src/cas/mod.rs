//! CAS transfer engine.
//!
//! Uploads skip whatever the remote store already holds, send small blobs in
//! batch requests and stream large ones in chunks that can resume after a
//! transient failure. Downloads take the same batch/stream split and verify
//! every blob against its digest. Outcomes are reported per digest so a
//! caller can retry just the failed subset.

pub mod retry;

use crate::blob::Blob;
use crate::config::CasConfig;
use crate::digest::Digest;
use crate::error::{MemoExecError, Result, RetryConfig, TransportError};
use crate::remote_exec::{
    BatchReadBlobsRequest, BatchUpdateBlobsRequest, BlobData, FindMissingBlobsRequest,
    QueryWriteStatusRequest, ReadRequest, Status, WriteRequest,
};
use crate::transport::Transport;
use retry::{backoff, cancellable, with_retry};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Which upload path carried a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    Batch,
    Stream,
}

/// Why a single blob could not be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    /// The store answered for this digest with a non-OK status
    Rejected(Status),
    /// The request carrying this digest failed as a whole
    Transport { error: TransportError, attempts: u32 },
    /// Local content no longer matches the digest
    Integrity { actual: Digest },
    /// Local content could not be read
    Local(String),
}

impl TransferFailure {
    fn from_error(err: MemoExecError) -> Self {
        match err {
            MemoExecError::TransientTransport {
                source, attempts, ..
            } => TransferFailure::Transport {
                error: source,
                attempts,
            },
            MemoExecError::Transport { source, .. } => TransferFailure::Transport {
                error: source,
                attempts: 1,
            },
            MemoExecError::CasIntegrityFailure { actual, .. } => {
                TransferFailure::Integrity { actual }
            }
            other => TransferFailure::Local(other.to_string()),
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFailure::Rejected(status) => {
                write!(f, "rejected: {}: {}", status.code, status.message)
            }
            TransferFailure::Transport { error, attempts } => {
                write!(f, "transport failure after {} attempts: {}", attempts, error)
            }
            TransferFailure::Integrity { actual } => {
                write!(f, "content changed since digesting (now {})", actual)
            }
            TransferFailure::Local(msg) => write!(f, "local failure: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    AlreadyPresent,
    Uploaded(TransferPath),
    Failed(TransferFailure),
}

/// Per-digest result of one `upload` call.
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub outcomes: HashMap<Digest, UploadOutcome>,
    pub bytes_uploaded: u64,
    pub batch_requests: usize,
    pub stream_uploads: usize,
}

impl UploadReport {
    pub fn failed(&self) -> Vec<&Digest> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, UploadOutcome::Failed(_)))
            .map(|(d, _)| d)
            .collect()
    }

    pub fn uploaded(&self) -> Vec<&Digest> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, UploadOutcome::Uploaded(_)))
            .map(|(d, _)| d)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| !matches!(o, UploadOutcome::Failed(_)))
    }

    /// Digests known to be present remotely after this call.
    pub fn acknowledged(&self) -> Vec<&Digest> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, UploadOutcome::Failed(_)))
            .map(|(d, _)| d)
            .collect()
    }

    /// Turn any per-digest failure into an error.
    pub fn ensure_complete(self) -> Result<Self> {
        let failed = self.failed().len();
        if failed > 0 {
            return Err(MemoExecError::IncompleteUpload {
                failed,
                total: self.outcomes.len(),
            });
        }
        Ok(self)
    }

    fn merge(&mut self, job: JobReport) {
        self.outcomes.extend(job.outcomes);
        self.bytes_uploaded += job.bytes;
        self.batch_requests += job.batch_requests;
        self.stream_uploads += job.stream_uploads;
    }
}

#[derive(Default)]
struct JobReport {
    outcomes: Vec<(Digest, UploadOutcome)>,
    bytes: u64,
    batch_requests: usize,
    stream_uploads: usize,
}

enum UploadJob {
    Batch(Vec<Blob>),
    Stream(Blob),
}

/// Group blobs into requests bounded by total bytes and blob count.
/// Input order is kept so grouping is deterministic for a sorted input.
fn plan_batches(blobs: Vec<Blob>, max_bytes: usize, max_blobs: usize) -> Vec<Vec<Blob>> {
    let mut batches = Vec::new();
    let mut current: Vec<Blob> = Vec::new();
    let mut current_bytes = 0usize;
    for blob in blobs {
        let size = blob.size() as usize;
        if !current.is_empty()
            && (current_bytes + size > max_bytes || current.len() >= max_blobs)
        {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(blob);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Client for the remote content-addressable store.
#[derive(Clone)]
pub struct CasClient {
    transport: Arc<dyn Transport>,
    config: CasConfig,
    retry: RetryConfig,
    limiter: Arc<Semaphore>,
}

impl CasClient {
    pub fn new(transport: Arc<dyn Transport>, config: CasConfig, retry: RetryConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1)));
        Self {
            transport,
            config,
            retry,
            limiter,
        }
    }

    pub fn config(&self) -> &CasConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn permit(&self, cancel: &CancellationToken) -> Result<SemaphorePermit<'_>> {
        cancellable(cancel, self.limiter.acquire())
            .await?
            .map_err(|_| MemoExecError::Local("transfer limiter closed".to_string()))
    }

    /// Subset of `digests` the remote store does not hold. The empty digest
    /// is always considered present.
    #[instrument(skip_all, fields(count = tracing::field::Empty))]
    pub async fn find_missing<'a, I>(&self, digests: I, cancel: &CancellationToken) -> Result<HashSet<Digest>>
    where
        I: IntoIterator<Item = &'a Digest>,
    {
        let mut unique: Vec<Digest> = digests
            .into_iter()
            .filter(|d| !d.is_empty())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        unique.sort();
        tracing::Span::current().record("count", unique.len());

        let queries = unique
            .chunks(self.config.max_find_missing_batch.max(1))
            .map(|chunk| async move {
                let _permit = self.permit(cancel).await?;
                let request = FindMissingBlobsRequest {
                    blob_digests: chunk.to_vec(),
                };
                with_retry("find_missing_blobs", &self.retry, true, cancel, || {
                    self.transport.find_missing_blobs(request.clone())
                })
                .await
            });

        let mut missing = HashSet::new();
        for response in futures::future::join_all(queries).await {
            missing.extend(response?.missing_blob_digests);
        }
        debug!(missing = missing.len(), "Existence query complete");
        Ok(missing)
    }

    /// Store every blob the remote side is missing.
    ///
    /// Returns `Err` only for cancellation or a failed existence query;
    /// individual blob failures are reported in the [`UploadReport`].
    #[instrument(skip_all, fields(blobs = blobs.len()))]
    pub async fn upload(
        &self,
        blobs: &HashMap<Digest, Blob>,
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        let start = Instant::now();
        let mut report = UploadReport::default();

        // A blob filed under a digest it does not hash to is never sent.
        let mut keyed = Vec::with_capacity(blobs.len());
        for (digest, blob) in blobs {
            if digest == blob.digest() {
                keyed.push((digest, blob));
            } else {
                warn!(key = %digest, actual = %blob.digest(), "Blob does not match its key");
                report.outcomes.insert(
                    digest.clone(),
                    UploadOutcome::Failed(TransferFailure::Integrity {
                        actual: blob.digest().clone(),
                    }),
                );
            }
        }

        let missing = self
            .find_missing(keyed.iter().map(|(digest, _)| *digest), cancel)
            .await?;
        let mut to_batch = Vec::new();
        let mut to_stream = Vec::new();
        for (digest, blob) in keyed {
            if !missing.contains(digest) {
                report
                    .outcomes
                    .insert(digest.clone(), UploadOutcome::AlreadyPresent);
            } else if blob.size() as usize <= self.config.max_batch_bytes {
                to_batch.push(blob.clone());
            } else {
                to_stream.push(blob.clone());
            }
        }
        to_batch.sort_by(|a, b| a.digest().cmp(b.digest()));
        to_stream.sort_by(|a, b| a.digest().cmp(b.digest()));

        let mut jobs: Vec<UploadJob> = to_stream.into_iter().map(UploadJob::Stream).collect();
        jobs.extend(
            plan_batches(to_batch, self.config.max_batch_bytes, self.config.max_batch_blobs)
                .into_iter()
                .map(UploadJob::Batch),
        );

        let results = futures::future::join_all(jobs.into_iter().map(|job| async move {
            let _permit = self.permit(cancel).await?;
            match job {
                UploadJob::Batch(batch) => self.upload_batch(batch, cancel).await,
                UploadJob::Stream(blob) => self.upload_stream(blob, cancel).await,
            }
        }))
        .await;

        for result in results {
            report.merge(result?);
        }

        let failed = report.failed().len();
        info!(
            present = report
                .outcomes
                .values()
                .filter(|o| matches!(o, UploadOutcome::AlreadyPresent))
                .count(),
            uploaded = report.uploaded().len(),
            failed,
            bytes = report.bytes_uploaded,
            duration_ms = start.elapsed().as_millis() as u64,
            "Upload complete"
        );
        Ok(report)
    }

    async fn upload_batch(&self, blobs: Vec<Blob>, cancel: &CancellationToken) -> Result<JobReport> {
        let mut job = JobReport::default();
        let mut pending: Vec<BlobData> = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match blob.read_all() {
                Ok(data) => pending.push(BlobData {
                    digest: blob.digest().clone(),
                    data,
                }),
                Err(err) => {
                    warn!(digest = %blob.digest(), error = %err, "Cannot read blob for upload");
                    job.outcomes.push((
                        blob.digest().clone(),
                        UploadOutcome::Failed(TransferFailure::from_error(err)),
                    ));
                }
            }
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        while !pending.is_empty() {
            attempt += 1;
            job.batch_requests += 1;
            let request = BatchUpdateBlobsRequest {
                requests: pending.clone(),
            };
            let response = match with_retry("batch_update_blobs", &self.retry, true, cancel, || {
                self.transport.batch_update_blobs(request.clone())
            })
            .await
            {
                Ok(response) => response,
                Err(MemoExecError::Cancelled) => return Err(MemoExecError::Cancelled),
                Err(err) => {
                    let failure = TransferFailure::from_error(err);
                    for blob in pending.drain(..) {
                        job.outcomes
                            .push((blob.digest, UploadOutcome::Failed(failure.clone())));
                    }
                    break;
                }
            };

            let mut statuses: HashMap<Digest, Status> = response
                .responses
                .into_iter()
                .map(|r| (r.digest, r.status))
                .collect();
            let mut retry_later = Vec::new();
            for blob in pending.drain(..) {
                let status = statuses.remove(&blob.digest).unwrap_or_else(|| {
                    Status::new(crate::error::Code::Internal, "no status returned for digest")
                });
                if status.is_ok() {
                    debug!(digest = %blob.digest.short(), "Blob stored via batch");
                    job.bytes += blob.data.len() as u64;
                    job.outcomes
                        .push((blob.digest, UploadOutcome::Uploaded(TransferPath::Batch)));
                } else if TransportError::from(status.clone()).is_transient(true)
                    && attempt < max_attempts
                {
                    retry_later.push(blob);
                } else {
                    job.outcomes.push((
                        blob.digest,
                        UploadOutcome::Failed(TransferFailure::Rejected(status)),
                    ));
                }
            }

            if !retry_later.is_empty() {
                warn!(
                    count = retry_later.len(),
                    attempt, "Re-sending blobs rejected with transient status"
                );
                backoff(attempt - 1, &self.retry, cancel).await?;
            }
            pending = retry_later;
        }
        Ok(job)
    }

    async fn upload_stream(&self, blob: Blob, cancel: &CancellationToken) -> Result<JobReport> {
        let digest = blob.digest().clone();
        let mut job = JobReport {
            stream_uploads: 1,
            ..Default::default()
        };
        let outcome = match self.stream_blob(&blob, cancel).await {
            Ok(bytes) => {
                job.bytes = bytes;
                UploadOutcome::Uploaded(TransferPath::Stream)
            }
            Err(MemoExecError::Cancelled) => return Err(MemoExecError::Cancelled),
            Err(err) => {
                warn!(digest = %digest, error = %err, "Streamed upload failed");
                UploadOutcome::Failed(TransferFailure::from_error(err))
            }
        };
        job.outcomes.push((digest, outcome));
        Ok(job)
    }

    /// Write one blob as a sequence of chunks. Returns the bytes sent.
    async fn stream_blob(&self, blob: &Blob, cancel: &CancellationToken) -> Result<u64> {
        blob.verify_source()?;

        let digest = blob.digest();
        let size = digest.size_bytes();
        let upload_id = Uuid::new_v4().to_string();
        let chunk_size = self.config.stream_chunk_size.max(1);
        let max_attempts = self.retry.max_attempts.max(1);

        let mut offset: i64 = 0;
        let mut sent: u64 = 0;
        let mut failures = 0u32;

        debug!(digest = %digest.short(), size, upload_id = %upload_id, "Streaming blob");
        while offset < size {
            let data = blob.read_chunk(offset as u64, chunk_size)?;
            if data.is_empty() {
                return Err(MemoExecError::Local(format!(
                    "blob {} ended at offset {} before its declared size",
                    digest, offset
                )));
            }
            let len = data.len() as i64;
            let request = WriteRequest {
                upload_id: upload_id.clone(),
                digest: digest.clone(),
                write_offset: offset,
                finish_write: offset + len >= size,
                data,
            };

            match cancellable(cancel, self.transport.write(request)).await? {
                Ok(response) => {
                    sent += len as u64;
                    // The store may report more than was sent when it already had the blob.
                    offset = response.committed_size.max(offset + len);
                    failures = 0;
                }
                Err(err) if err.is_transient(true) => {
                    failures += 1;
                    if failures >= max_attempts {
                        return Err(MemoExecError::TransientTransport {
                            operation: "write".to_string(),
                            attempts: failures,
                            source: err,
                        });
                    }
                    warn!(
                        digest = %digest.short(),
                        offset,
                        attempt = failures,
                        error = %err,
                        "Stream write failed, resuming"
                    );
                    backoff(failures - 1, &self.retry, cancel).await?;
                    offset = self.committed_offset(&upload_id, digest, cancel).await?;
                }
                Err(err) => {
                    return Err(MemoExecError::Transport {
                        operation: "write".to_string(),
                        source: err,
                    })
                }
            }
        }
        Ok(sent)
    }

    /// Where to resume a broken stream; a complete write counts as the full size.
    async fn committed_offset(
        &self,
        upload_id: &str,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let request = QueryWriteStatusRequest {
            upload_id: upload_id.to_string(),
            digest: digest.clone(),
        };
        let status = with_retry("query_write_status", &self.retry, true, cancel, || {
            self.transport.query_write_status(request.clone())
        })
        .await;
        match status {
            Ok(status) if status.complete => Ok(digest.size_bytes()),
            Ok(status) => Ok(status.committed_size.clamp(0, digest.size_bytes())),
            // An unknown session restarts from the beginning.
            Err(MemoExecError::Transport { source, .. })
                if source.code == crate::error::Code::NotFound =>
            {
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch and verify blobs by digest. Any missing or corrupt blob fails the call.
    #[instrument(skip_all, fields(count = tracing::field::Empty))]
    pub async fn download<'a, I>(
        &self,
        digests: I,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Digest, Blob>>
    where
        I: IntoIterator<Item = &'a Digest>,
    {
        let start = Instant::now();
        let mut unique: Vec<Digest> = digests
            .into_iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        unique.sort();
        tracing::Span::current().record("count", unique.len());

        let mut blobs = HashMap::with_capacity(unique.len());
        let mut small = Vec::new();
        let mut large = Vec::new();
        for digest in unique {
            if digest.is_empty() {
                blobs.insert(digest, Blob::from_bytes(Vec::new()));
            } else if digest.size_bytes() as usize <= self.config.max_batch_bytes {
                small.push(digest);
            } else {
                large.push(digest);
            }
        }

        let mut batches: Vec<Vec<Digest>> = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0usize;
        for digest in small {
            let size = digest.size_bytes() as usize;
            if !current.is_empty()
                && (current_bytes + size > self.config.max_batch_bytes
                    || current.len() >= self.config.max_batch_blobs)
            {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += size;
            current.push(digest);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let batch_reads = batches.into_iter().map(|batch| async move {
            let _permit = self.permit(cancel).await?;
            self.read_batch(batch, cancel).await
        });
        let stream_reads = large.into_iter().map(|digest| async move {
            let _permit = self.permit(cancel).await?;
            let data = self.read_stream(&digest, cancel).await?;
            Ok::<_, MemoExecError>(vec![Blob::with_digest(digest, data)?])
        });

        let (batch_results, stream_results) = futures::future::join(
            futures::future::join_all(batch_reads),
            futures::future::join_all(stream_reads),
        )
        .await;

        let mut bytes = 0u64;
        for result in batch_results.into_iter().chain(stream_results) {
            for blob in result? {
                bytes += blob.size() as u64;
                blobs.insert(blob.digest().clone(), blob);
            }
        }
        info!(
            blobs = blobs.len(),
            bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Download complete"
        );
        Ok(blobs)
    }

    async fn read_batch(&self, digests: Vec<Digest>, cancel: &CancellationToken) -> Result<Vec<Blob>> {
        let mut blobs = Vec::with_capacity(digests.len());
        let mut pending = digests;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        while !pending.is_empty() {
            attempt += 1;
            let request = BatchReadBlobsRequest {
                digests: pending.clone(),
            };
            let response = with_retry("batch_read_blobs", &self.retry, true, cancel, || {
                self.transport.batch_read_blobs(request.clone())
            })
            .await?;

            let mut results: HashMap<Digest, _> = response
                .responses
                .into_iter()
                .map(|r| (r.digest.clone(), r))
                .collect();
            let mut retry_later = Vec::new();
            for digest in pending.drain(..) {
                let Some(result) = results.remove(&digest) else {
                    return Err(MemoExecError::Transport {
                        operation: "batch_read_blobs".to_string(),
                        source: TransportError::new(
                            crate::error::Code::Internal,
                            format!("no result returned for {}", digest),
                        ),
                    });
                };
                if result.status.is_ok() {
                    // Integrity failures are reported immediately, never retried.
                    blobs.push(Blob::with_digest(digest, result.data)?);
                    continue;
                }
                let err = TransportError::from(result.status);
                if err.is_transient(true) && attempt < max_attempts {
                    retry_later.push(digest);
                } else if err.is_transient(true) {
                    return Err(MemoExecError::TransientTransport {
                        operation: "batch_read_blobs".to_string(),
                        attempts: attempt,
                        source: err,
                    });
                } else {
                    return Err(MemoExecError::Transport {
                        operation: format!("batch_read_blobs({})", digest),
                        source: err,
                    });
                }
            }
            if !retry_later.is_empty() {
                backoff(attempt - 1, &self.retry, cancel).await?;
            }
            pending = retry_later;
        }
        Ok(blobs)
    }

    async fn read_stream(&self, digest: &Digest, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let size = digest.size_bytes();
        let chunk_size = self.config.stream_chunk_size.max(1);
        // The claimed size comes from the remote side; grow as data arrives.
        let mut data = Vec::with_capacity(size.clamp(0, chunk_size as i64) as usize);
        while (data.len() as i64) < size {
            let request = ReadRequest {
                digest: digest.clone(),
                read_offset: data.len() as i64,
                read_limit: chunk_size as i64,
            };
            let response = with_retry("read", &self.retry, true, cancel, || {
                self.transport.read(request.clone())
            })
            .await?;
            if response.data.is_empty() {
                break;
            }
            data.extend_from_slice(&response.data);
            if data.len() as i64 > size {
                return Err(MemoExecError::CasIntegrityFailure {
                    expected: digest.clone(),
                    actual: Digest::of_bytes(&data),
                });
            }
        }
        debug!(digest = %digest.short(), bytes = data.len(), "Blob streamed from CAS");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize, fill: u8) -> Blob {
        Blob::from_bytes(vec![fill; len])
    }

    #[test]
    fn test_plan_batches_respects_byte_ceiling() {
        let blobs = vec![blob(40, 1), blob(40, 2), blob(40, 3)];
        let batches = plan_batches(blobs, 100, 10);
        let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_plan_batches_respects_count_ceiling() {
        let blobs = (0..5).map(|i| blob(1, i)).collect();
        let batches = plan_batches(blobs, 1000, 2);
        let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_report_ensure_complete() {
        let mut report = UploadReport::default();
        report
            .outcomes
            .insert(Digest::of_bytes(b"a"), UploadOutcome::AlreadyPresent);
        report.outcomes.insert(
            Digest::of_bytes(b"b"),
            UploadOutcome::Failed(TransferFailure::Local("gone".into())),
        );
        assert_eq!(report.acknowledged().len(), 1);
        assert!(!report.is_complete());
        assert!(matches!(
            report.ensure_complete(),
            Err(MemoExecError::IncompleteUpload { failed: 1, total: 2 })
        ));
    }
}
