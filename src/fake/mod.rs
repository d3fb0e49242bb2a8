//! In-process stand-in for a remote execution service.
//!
//! Every test owns its own [`FakeServer`]; nothing here is global, so tests
//! can run concurrently.

pub mod action_cache;
pub mod cas;
pub mod env;
pub mod exec;
#[cfg(feature = "server")]
pub mod server;

pub use action_cache::FakeActionCache;
pub use cas::{CasOp, CasStats, FakeCas};
pub use env::{FakeResult, TestEnv};
pub use exec::FakeExec;

use crate::remote_exec::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, CancelOperationRequest, ExecuteRequest, FindMissingBlobsRequest,
    FindMissingBlobsResponse, GetActionResultRequest, Operation, QueryWriteStatusRequest,
    QueryWriteStatusResponse, ReadRequest, ReadResponse, UpdateActionResultRequest,
    WaitExecutionRequest, WriteRequest, WriteResponse,
};
use crate::transport::{Transport, TransportResult};
use async_trait::async_trait;
use std::time::Duration;

/// Longest a single `wait_execution` call blocks before reporting progress.
const WAIT_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct FakeServer {
    pub cas: FakeCas,
    pub action_cache: FakeActionCache,
    pub exec: FakeExec,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset CAS, action cache and execution state.
    pub fn clear(&self) {
        self.cas.clear();
        self.action_cache.clear();
        self.exec.clear();
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn find_missing_blobs(
        &self,
        request: FindMissingBlobsRequest,
    ) -> TransportResult<FindMissingBlobsResponse> {
        self.cas.find_missing_blobs(request)
    }

    async fn batch_update_blobs(
        &self,
        request: BatchUpdateBlobsRequest,
    ) -> TransportResult<BatchUpdateBlobsResponse> {
        self.cas.batch_update_blobs(request)
    }

    async fn batch_read_blobs(
        &self,
        request: BatchReadBlobsRequest,
    ) -> TransportResult<BatchReadBlobsResponse> {
        self.cas.batch_read_blobs(request)
    }

    async fn write(&self, request: WriteRequest) -> TransportResult<WriteResponse> {
        self.cas.write(request)
    }

    async fn query_write_status(
        &self,
        request: QueryWriteStatusRequest,
    ) -> TransportResult<QueryWriteStatusResponse> {
        self.cas.query_write_status(request)
    }

    async fn read(&self, request: ReadRequest) -> TransportResult<ReadResponse> {
        self.cas.read(request)
    }

    async fn get_action_result(
        &self,
        request: GetActionResultRequest,
    ) -> TransportResult<Option<ActionResult>> {
        Ok(self.action_cache.get(&request.action_digest))
    }

    async fn update_action_result(
        &self,
        request: UpdateActionResultRequest,
    ) -> TransportResult<ActionResult> {
        self.action_cache
            .put(request.action_digest, request.action_result.clone());
        Ok(request.action_result)
    }

    async fn execute(&self, request: ExecuteRequest) -> TransportResult<Operation> {
        self.exec.execute(request, &self.cas, &self.action_cache)
    }

    async fn wait_execution(&self, request: WaitExecutionRequest) -> TransportResult<Operation> {
        let remaining = self.exec.remaining(&request.name);
        if !remaining.is_zero() {
            tokio::time::sleep(remaining.min(WAIT_WINDOW)).await;
        }
        self.exec.poll(&request.name)
    }

    async fn cancel_operation(&self, request: CancelOperationRequest) -> TransportResult<()> {
        self.exec.cancel(&request.name)
    }
}
