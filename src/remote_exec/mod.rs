//! Wire messages exchanged with the remote execution service.
//!
//! These follow the Bazel / REAPI (Remote Execution API) message shapes but
//! are plain serde structs; the transport decides how they travel. Every
//! message that gets digested keeps a fixed field order and sorted
//! collections so that its serialized form is canonical.

use crate::digest::Digest;
use crate::error::{Code, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde adapter storing byte fields as base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProperty {
    pub name: String,
    pub value: String,
}

/// Maps to: build.bazel.remote.execution.v2.Command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub arguments: Vec<String>,
    /// Sorted by name
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Sorted, relative to the working directory
    pub output_files: Vec<String>,
    pub working_directory: String,
    /// Sorted by name
    pub platform: Vec<PlatformProperty>,
}

/// Maps to: build.bazel.remote.execution.v2.Action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub do_not_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

/// One directory listing. Maps to: build.bazel.remote.execution.v2.Directory
///
/// Each list must be sorted by name before the message is digested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
    pub symlinks: Vec<SymlinkNode>,
}

impl Directory {
    pub fn canonicalize(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
        self.symlinks.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Serialized form of a symlink target, used to give symlinks a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkTarget {
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub worker: String,
    pub queued_timestamp: Option<i64>,
    pub worker_start_timestamp: Option<i64>,
    pub worker_completed_timestamp: Option<i64>,
}

/// ActionResult represents the result of a remote execution.
/// Maps to: build.bazel.remote.execution.v2.ActionResult
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    pub exit_code: i32,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub stdout_raw: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_digest: Option<Digest>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub stderr_raw: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_digest: Option<Digest>,
    #[serde(default)]
    pub execution_metadata: ExecutionMetadata,
}

/// Maps to: google.rpc.Status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        Self::new(err.code, err.message)
    }
}

impl From<Status> for TransportError {
    fn from(status: Status) -> Self {
        TransportError::new(status.code, status.message)
    }
}

// --- Content-addressable storage ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindMissingBlobsRequest {
    pub blob_digests: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindMissingBlobsResponse {
    pub missing_blob_digests: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobData {
    pub digest: Digest,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateBlobsRequest {
    pub requests: Vec<BlobData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStatus {
    pub digest: Digest,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateBlobsResponse {
    pub responses: Vec<BlobStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReadBlobsRequest {
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBlobResult {
    pub digest: Digest,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReadBlobsResponse {
    pub responses: Vec<ReadBlobResult>,
}

/// One chunk of a streamed upload. Maps to: google.bytestream.WriteRequest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub upload_id: String,
    pub digest: Digest,
    pub write_offset: i64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub finish_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub committed_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWriteStatusRequest {
    pub upload_id: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWriteStatusResponse {
    pub committed_size: i64,
    pub complete: bool,
}

/// Maps to: google.bytestream.ReadRequest; a zero limit reads to the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub digest: Digest,
    pub read_offset: i64,
    pub read_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

// --- Action cache ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetActionResultRequest {
    pub action_digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateActionResultRequest {
    pub action_digest: Digest,
    pub action_result: ActionResult,
}

// --- Execution ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub action_digest: Digest,
    pub skip_cache_lookup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default)]
    pub cached_result: bool,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub message: String,
}

/// Terminal payload of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Response(ExecuteResponse),
    Error(Status),
}

/// Handle on an in-progress or finished execution.
/// Maps to: google.longrunning.Operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitExecutionRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOperationRequest {
    pub name: String,
}
