use super::{Transport, TransportResult};
use crate::error::{Code, MemoExecError, Result, TransportError};
use crate::remote_exec::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, CancelOperationRequest, ExecuteRequest, FindMissingBlobsRequest,
    FindMissingBlobsResponse, GetActionResultRequest, Operation, QueryWriteStatusRequest,
    QueryWriteStatusResponse, ReadRequest, ReadResponse, Status, UpdateActionResultRequest,
    WaitExecutionRequest, WriteRequest, WriteResponse,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Per-request deadline; long enough to cover a server-side long poll.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP status used to carry a non-OK [`Code`]. Shared with the fake server so
/// both sides agree on the mapping.
pub fn http_status_for(code: Code) -> u16 {
    match code {
        Code::Ok => 200,
        Code::InvalidArgument | Code::OutOfRange => 400,
        Code::Unauthenticated => 401,
        Code::PermissionDenied => 403,
        Code::NotFound => 404,
        Code::AlreadyExists | Code::Aborted => 409,
        Code::FailedPrecondition => 412,
        Code::ResourceExhausted => 429,
        Code::Cancelled => 499,
        Code::Unimplemented => 501,
        Code::Unavailable => 503,
        Code::DeadlineExceeded => 504,
        Code::Unknown | Code::Internal | Code::DataLoss => 500,
    }
}

fn code_for_http_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::Aborted,
        412 => Code::FailedPrecondition,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        501 => Code::Unimplemented,
        502 | 503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        _ => Code::Internal,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    let code = if err.is_timeout() {
        Code::DeadlineExceeded
    } else if err.is_connect() || err.is_request() {
        Code::Unavailable
    } else if err.is_decode() {
        Code::Internal
    } else {
        Code::Unknown
    };
    TransportError::new(code, err.to_string())
}

/// JSON-over-HTTP transport. Every operation is a POST to a fixed path below
/// the endpoint; failures come back as a non-2xx status with a JSON
/// [`Status`] body.
pub struct HttpTransport {
    endpoint: String,
    client: Client,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoExecError::Local(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> TransportResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.endpoint, path);
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        crate::log_remote_operation!(path, status, start.elapsed().as_millis() as u64);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = match serde_json::from_str::<Status>(&body) {
                Ok(remote) => TransportError::from(remote),
                Err(_) => TransportError::new(
                    code_for_http_status(status),
                    format!("{} returned {}: {}", url, status, body),
                ),
            };
            return Err(err);
        }

        response.json::<Resp>().await.map_err(map_reqwest_error)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn find_missing_blobs(
        &self,
        request: FindMissingBlobsRequest,
    ) -> TransportResult<FindMissingBlobsResponse> {
        self.post("/cas/find_missing", &request).await
    }

    async fn batch_update_blobs(
        &self,
        request: BatchUpdateBlobsRequest,
    ) -> TransportResult<BatchUpdateBlobsResponse> {
        self.post("/cas/batch_update", &request).await
    }

    async fn batch_read_blobs(
        &self,
        request: BatchReadBlobsRequest,
    ) -> TransportResult<BatchReadBlobsResponse> {
        self.post("/cas/batch_read", &request).await
    }

    async fn write(&self, request: WriteRequest) -> TransportResult<WriteResponse> {
        self.post("/bytestream/write", &request).await
    }

    async fn query_write_status(
        &self,
        request: QueryWriteStatusRequest,
    ) -> TransportResult<QueryWriteStatusResponse> {
        self.post("/bytestream/status", &request).await
    }

    async fn read(&self, request: ReadRequest) -> TransportResult<ReadResponse> {
        self.post("/bytestream/read", &request).await
    }

    async fn get_action_result(
        &self,
        request: GetActionResultRequest,
    ) -> TransportResult<Option<ActionResult>> {
        self.post("/ac/get", &request).await
    }

    async fn update_action_result(
        &self,
        request: UpdateActionResultRequest,
    ) -> TransportResult<ActionResult> {
        self.post("/ac/update", &request).await
    }

    async fn execute(&self, request: ExecuteRequest) -> TransportResult<Operation> {
        self.post("/exec/execute", &request).await
    }

    async fn wait_execution(&self, request: WaitExecutionRequest) -> TransportResult<Operation> {
        self.post("/exec/wait", &request).await
    }

    async fn cancel_operation(&self, request: CancelOperationRequest) -> TransportResult<()> {
        self.post("/exec/cancel", &request).await
    }
}
