use crate::digest::Digest;
use crate::error::{Code, TransportError};
use crate::remote_exec::{
    BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, BlobStatus, FindMissingBlobsRequest, FindMissingBlobsResponse,
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadBlobResult, ReadRequest, ReadResponse,
    Status, WriteRequest, WriteResponse,
};
use crate::transport::TransportResult;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// CAS calls a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CasOp {
    FindMissing,
    BatchUpdate,
    BatchRead,
    Write,
    QueryWriteStatus,
    Read,
}

#[derive(Debug, Clone)]
struct Fault {
    op: CasOp,
    /// Calls to let through before failing
    skip: usize,
    remaining: usize,
    code: Code,
}

#[derive(Debug, Clone)]
struct PerDigestRejection {
    code: Code,
    /// `None` rejects forever
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct WriteSession {
    digest: Option<Digest>,
    data: Vec<u8>,
    complete: bool,
}

/// Counters exposed to tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CasStats {
    pub find_missing_requests: usize,
    pub batch_update_requests: usize,
    pub batch_read_requests: usize,
    pub write_requests: usize,
    pub read_requests: usize,
    /// Blob payload bytes accepted through batch or stream writes
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct CasState {
    blobs: HashMap<Digest, Vec<u8>>,
    writes: HashMap<Digest, usize>,
    reads: HashMap<Digest, usize>,
    sessions: HashMap<String, WriteSession>,
    stats: CasStats,
    faults: Vec<Fault>,
    rejections: HashMap<Digest, PerDigestRejection>,
    corrupted: HashSet<Digest>,
    max_batch_bytes: Option<usize>,
}

impl CasState {
    fn check_fault(&mut self, op: CasOp) -> TransportResult<()> {
        let Some(fault) = self.faults.iter_mut().find(|f| f.op == op && f.remaining > 0) else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        fault.remaining -= 1;
        let code = fault.code;
        self.faults.retain(|f| f.remaining > 0);
        Err(TransportError::new(code, format!("injected {:?} failure", op)))
    }

    fn rejection(&mut self, digest: &Digest) -> Option<Code> {
        let rejection = self.rejections.get_mut(digest)?;
        match &mut rejection.remaining {
            None => Some(rejection.code),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(rejection.code)
            }
        }
    }

    fn store(&mut self, digest: Digest, data: Vec<u8>) {
        self.stats.bytes_received += data.len() as u64;
        *self.writes.entry(digest.clone()).or_default() += 1;
        self.blobs.insert(digest, data);
    }

    fn load(&mut self, digest: &Digest) -> Option<Vec<u8>> {
        if digest.is_empty() {
            return Some(Vec::new());
        }
        let mut data = self.blobs.get(digest)?.clone();
        *self.reads.entry(digest.clone()).or_default() += 1;
        if self.corrupted.contains(digest) {
            match data.first_mut() {
                Some(byte) => *byte ^= 0xff,
                None => data.push(0),
            }
        }
        Some(data)
    }
}

/// In-memory content-addressable store that verifies everything it accepts.
#[derive(Debug, Default)]
pub struct FakeCas {
    state: Mutex<CasState>,
}

impl FakeCas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all blobs, counters and injected faults.
    pub fn clear(&self) {
        *self.state.lock() = CasState::default();
    }

    /// Store `data` directly, bypassing counters.
    pub fn put(&self, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(data);
        self.state.lock().blobs.insert(digest.clone(), data.to_vec());
        digest
    }

    /// Store `data` under `digest` without checking that they match, the
    /// way a misbehaving store would.
    pub fn put_unverified(&self, digest: Digest, data: &[u8]) {
        self.state.lock().blobs.insert(digest, data.to_vec());
    }

    pub fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
        if digest.is_empty() {
            return Some(Vec::new());
        }
        self.state.lock().blobs.get(digest).cloned()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        digest.is_empty() || self.state.lock().blobs.contains_key(digest)
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().blobs.len()
    }

    /// How many times `digest` was written by a client.
    pub fn write_count(&self, digest: &Digest) -> usize {
        self.state.lock().writes.get(digest).copied().unwrap_or(0)
    }

    pub fn read_count(&self, digest: &Digest) -> usize {
        self.state.lock().reads.get(digest).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> CasStats {
        self.state.lock().stats.clone()
    }

    /// Fail the next `count` calls of `op` with `code`.
    pub fn fail_next(&self, op: CasOp, count: usize, code: Code) {
        self.fail_after(op, 0, count, code);
    }

    /// Let `skip` calls of `op` through, then fail the following `count`.
    pub fn fail_after(&self, op: CasOp, skip: usize, count: usize, code: Code) {
        self.state.lock().faults.push(Fault {
            op,
            skip,
            remaining: count,
            code,
        });
    }

    /// Answer every batch write of `digest` with `code`.
    pub fn reject(&self, digest: Digest, code: Code) {
        self.state.lock().rejections.insert(
            digest,
            PerDigestRejection {
                code,
                remaining: None,
            },
        );
    }

    /// Answer the next `times` batch writes of `digest` with `code`.
    pub fn reject_times(&self, digest: Digest, code: Code, times: usize) {
        self.state.lock().rejections.insert(
            digest,
            PerDigestRejection {
                code,
                remaining: Some(times),
            },
        );
    }

    /// Serve altered bytes for `digest` on every read.
    pub fn corrupt(&self, digest: Digest) {
        self.state.lock().corrupted.insert(digest);
    }

    /// Refuse batch requests whose payload exceeds `max` bytes.
    pub fn set_max_batch_bytes(&self, max: usize) {
        self.state.lock().max_batch_bytes = Some(max);
    }

    pub fn find_missing_blobs(
        &self,
        request: FindMissingBlobsRequest,
    ) -> TransportResult<FindMissingBlobsResponse> {
        let mut state = self.state.lock();
        state.stats.find_missing_requests += 1;
        state.check_fault(CasOp::FindMissing)?;
        let missing_blob_digests = request
            .blob_digests
            .into_iter()
            .filter(|d| !d.is_empty() && !state.blobs.contains_key(d))
            .collect();
        Ok(FindMissingBlobsResponse {
            missing_blob_digests,
        })
    }

    pub fn batch_update_blobs(
        &self,
        request: BatchUpdateBlobsRequest,
    ) -> TransportResult<BatchUpdateBlobsResponse> {
        let mut state = self.state.lock();
        state.stats.batch_update_requests += 1;
        state.check_fault(CasOp::BatchUpdate)?;
        if let Some(max) = state.max_batch_bytes {
            let total: usize = request.requests.iter().map(|r| r.data.len()).sum();
            if total > max {
                return Err(TransportError::new(
                    Code::InvalidArgument,
                    format!("batch of {} bytes exceeds limit {}", total, max),
                ));
            }
        }

        let mut responses = Vec::with_capacity(request.requests.len());
        for blob in request.requests {
            let status = if let Some(code) = state.rejection(&blob.digest) {
                Status::new(code, "rejected by test configuration")
            } else if Digest::of_bytes(&blob.data) != blob.digest {
                Status::new(Code::InvalidArgument, "content does not match digest")
            } else {
                state.store(blob.digest.clone(), blob.data);
                Status::ok()
            };
            responses.push(BlobStatus {
                digest: blob.digest,
                status,
            });
        }
        Ok(BatchUpdateBlobsResponse { responses })
    }

    pub fn batch_read_blobs(
        &self,
        request: BatchReadBlobsRequest,
    ) -> TransportResult<BatchReadBlobsResponse> {
        let mut state = self.state.lock();
        state.stats.batch_read_requests += 1;
        state.check_fault(CasOp::BatchRead)?;
        let responses = request
            .digests
            .into_iter()
            .map(|digest| match state.load(&digest) {
                Some(data) => ReadBlobResult {
                    digest,
                    data,
                    status: Status::ok(),
                },
                None => ReadBlobResult {
                    digest,
                    data: Vec::new(),
                    status: Status::new(Code::NotFound, "blob not found"),
                },
            })
            .collect();
        Ok(BatchReadBlobsResponse { responses })
    }

    pub fn write(&self, request: WriteRequest) -> TransportResult<WriteResponse> {
        let mut state = self.state.lock();
        state.stats.write_requests += 1;
        state.check_fault(CasOp::Write)?;

        if state.blobs.contains_key(&request.digest) {
            // Already stored: report the whole blob as committed.
            return Ok(WriteResponse {
                committed_size: request.digest.size_bytes(),
            });
        }

        let session = state.sessions.entry(request.upload_id.clone()).or_default();
        if session.complete {
            return Err(TransportError::new(
                Code::FailedPrecondition,
                "upload already finished",
            ));
        }
        if let Some(existing) = &session.digest {
            if existing != &request.digest {
                return Err(TransportError::new(
                    Code::InvalidArgument,
                    "upload id reused for another digest",
                ));
            }
        }
        if request.write_offset != session.data.len() as i64 {
            return Err(TransportError::new(
                Code::InvalidArgument,
                format!(
                    "write offset {} does not match committed size {}",
                    request.write_offset,
                    session.data.len()
                ),
            ));
        }
        session.digest = Some(request.digest.clone());
        session.data.extend_from_slice(&request.data);
        let committed_size = session.data.len() as i64;

        if !request.finish_write {
            return Ok(WriteResponse { committed_size });
        }

        session.complete = true;
        let data = std::mem::take(&mut session.data);
        if Digest::of_bytes(&data) != request.digest {
            state.sessions.remove(&request.upload_id);
            return Err(TransportError::new(
                Code::InvalidArgument,
                "streamed content does not match digest",
            ));
        }
        state.store(request.digest, data);
        Ok(WriteResponse { committed_size })
    }

    pub fn query_write_status(
        &self,
        request: QueryWriteStatusRequest,
    ) -> TransportResult<QueryWriteStatusResponse> {
        let mut state = self.state.lock();
        state.check_fault(CasOp::QueryWriteStatus)?;
        if state.blobs.contains_key(&request.digest) {
            return Ok(QueryWriteStatusResponse {
                committed_size: request.digest.size_bytes(),
                complete: true,
            });
        }
        match state.sessions.get(&request.upload_id) {
            Some(session) => Ok(QueryWriteStatusResponse {
                committed_size: session.data.len() as i64,
                complete: session.complete,
            }),
            None => Err(TransportError::new(Code::NotFound, "unknown upload id")),
        }
    }

    pub fn read(&self, request: ReadRequest) -> TransportResult<ReadResponse> {
        let mut state = self.state.lock();
        state.stats.read_requests += 1;
        state.check_fault(CasOp::Read)?;
        let data = state
            .load(&request.digest)
            .ok_or_else(|| TransportError::new(Code::NotFound, "blob not found"))?;
        let start = (request.read_offset.max(0) as usize).min(data.len());
        let end = if request.read_limit > 0 {
            start.saturating_add(request.read_limit as usize).min(data.len())
        } else {
            data.len()
        };
        Ok(ReadResponse {
            data: data[start..end].to_vec(),
        })
    }
}
