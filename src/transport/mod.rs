//! The contract the client needs from a remote execution service.
//!
//! Any implementation works: [`http::HttpTransport`] talks JSON over HTTP,
//! [`crate::fake::FakeServer`] answers in-process.

pub mod http;

use crate::error::TransportError;
use crate::remote_exec::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, CancelOperationRequest, ExecuteRequest, FindMissingBlobsRequest,
    FindMissingBlobsResponse, GetActionResultRequest, Operation, QueryWriteStatusRequest,
    QueryWriteStatusResponse, ReadRequest, ReadResponse, UpdateActionResultRequest,
    WaitExecutionRequest, WriteRequest, WriteResponse,
};
use async_trait::async_trait;

pub use http::HttpTransport;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait Transport: Send + Sync {
    // Content-addressable storage
    async fn find_missing_blobs(
        &self,
        request: FindMissingBlobsRequest,
    ) -> TransportResult<FindMissingBlobsResponse>;

    async fn batch_update_blobs(
        &self,
        request: BatchUpdateBlobsRequest,
    ) -> TransportResult<BatchUpdateBlobsResponse>;

    async fn batch_read_blobs(
        &self,
        request: BatchReadBlobsRequest,
    ) -> TransportResult<BatchReadBlobsResponse>;

    // Byte streams. Each write carries one chunk at an explicit offset.
    async fn write(&self, request: WriteRequest) -> TransportResult<WriteResponse>;

    async fn query_write_status(
        &self,
        request: QueryWriteStatusRequest,
    ) -> TransportResult<QueryWriteStatusResponse>;

    async fn read(&self, request: ReadRequest) -> TransportResult<ReadResponse>;

    // Action cache. A miss is `Ok(None)`, not an error.
    async fn get_action_result(
        &self,
        request: GetActionResultRequest,
    ) -> TransportResult<Option<ActionResult>>;

    async fn update_action_result(
        &self,
        request: UpdateActionResultRequest,
    ) -> TransportResult<ActionResult>;

    // Execution
    async fn execute(&self, request: ExecuteRequest) -> TransportResult<Operation>;

    /// Returns the operation once it is done or when the server decides to
    /// report progress, whichever comes first.
    async fn wait_execution(&self, request: WaitExecutionRequest) -> TransportResult<Operation>;

    async fn cancel_operation(&self, request: CancelOperationRequest) -> TransportResult<()>;
}
