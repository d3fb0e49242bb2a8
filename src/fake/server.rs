//! HTTP front for a [`FakeServer`], matching the paths [`HttpTransport`] posts to.
//!
//! [`HttpTransport`]: crate::transport::HttpTransport

use super::FakeServer;
use crate::error::TransportError;
use crate::remote_exec::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, CancelOperationRequest, ExecuteRequest, FindMissingBlobsRequest,
    FindMissingBlobsResponse, GetActionResultRequest, Operation, QueryWriteStatusRequest,
    QueryWriteStatusResponse, ReadRequest, ReadResponse, Status, UpdateActionResultRequest,
    WaitExecutionRequest, WriteRequest, WriteResponse,
};
use crate::transport::http::http_status_for;
use crate::transport::Transport;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

/// A transport failure rendered as an HTTP error with a JSON status body.
struct StatusError(TransportError);

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(http_status_for(self.0.code))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(Status::from(self.0))).into_response()
    }
}

type Reply<T> = std::result::Result<Json<T>, StatusError>;

fn reply<T>(result: std::result::Result<T, TransportError>) -> Reply<T> {
    result.map(Json).map_err(StatusError)
}

pub fn router(server: Arc<FakeServer>) -> Router {
    Router::new()
        .route("/cas/find_missing", post(find_missing))
        .route("/cas/batch_update", post(batch_update))
        .route("/cas/batch_read", post(batch_read))
        .route("/bytestream/write", post(write))
        .route("/bytestream/status", post(query_write_status))
        .route("/bytestream/read", post(read))
        .route("/ac/get", post(get_action_result))
        .route("/ac/update", post(update_action_result))
        .route("/exec/execute", post(execute))
        .route("/exec/wait", post(wait_execution))
        .route("/exec/cancel", post(cancel_operation))
        .layer(Extension(server))
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve in the background. Returns the bound address, which
/// differs from `addr` when port 0 was requested.
pub async fn spawn(server: Arc<FakeServer>, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
    let http = axum::Server::try_bind(&addr)?.serve(router(server).into_make_service());
    let local = http.local_addr();
    info!(addr = %local, "Fake remote execution server listening");
    let handle = tokio::spawn(async move {
        if let Err(e) = http.await {
            tracing::error!(error = %e, "Fake server stopped");
        }
    });
    Ok((local, handle))
}

/// Serve until the process is stopped.
pub async fn serve(server: Arc<FakeServer>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Fake remote execution server listening");
    axum::Server::bind(&addr)
        .serve(router(server).into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

async fn find_missing(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<FindMissingBlobsRequest>,
) -> Reply<FindMissingBlobsResponse> {
    reply(server.find_missing_blobs(request).await)
}

async fn batch_update(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<BatchUpdateBlobsRequest>,
) -> Reply<BatchUpdateBlobsResponse> {
    reply(server.batch_update_blobs(request).await)
}

async fn batch_read(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<BatchReadBlobsRequest>,
) -> Reply<BatchReadBlobsResponse> {
    reply(server.batch_read_blobs(request).await)
}

async fn write(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<WriteRequest>,
) -> Reply<WriteResponse> {
    reply(server.write(request).await)
}

async fn query_write_status(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<QueryWriteStatusRequest>,
) -> Reply<QueryWriteStatusResponse> {
    reply(server.query_write_status(request).await)
}

async fn read(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<ReadRequest>,
) -> Reply<ReadResponse> {
    reply(server.read(request).await)
}

async fn get_action_result(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<GetActionResultRequest>,
) -> Reply<Option<ActionResult>> {
    reply(server.get_action_result(request).await)
}

async fn update_action_result(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<UpdateActionResultRequest>,
) -> Reply<ActionResult> {
    reply(server.update_action_result(request).await)
}

async fn execute(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<ExecuteRequest>,
) -> Reply<Operation> {
    reply(server.execute(request).await)
}

async fn wait_execution(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<WaitExecutionRequest>,
) -> Reply<Operation> {
    reply(server.wait_execution(request).await)
}

async fn cancel_operation(
    Extension(server): Extension<Arc<FakeServer>>,
    Json(request): Json<CancelOperationRequest>,
) -> Reply<()> {
    reply(server.cancel_operation(request).await)
}
