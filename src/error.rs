/// memoexec error types and retry utilities
use crate::command::ResultStatus;
use crate::constants::{DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_RETRY_ATTEMPTS};
use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Canonical status codes carried by the transport and by remote execution statuses.
/// Maps to: google.rpc.Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call on the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: Code,
    pub message: String,
}

impl TransportError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed. Deadline expiry only counts for
    /// idempotent calls, where repeating the request cannot double-apply it.
    pub fn is_transient(&self, idempotent: bool) -> bool {
        match self.code {
            Code::Unavailable | Code::ResourceExhausted | Code::Aborted => true,
            Code::DeadlineExceeded => idempotent,
            _ => false,
        }
    }
}

/// Main error type for memoexec operations
#[derive(Debug, thiserror::Error)]
pub enum MemoExecError {
    /// A declared, non-excluded input could not be read
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// CAS content does not match its claimed digest
    #[error("CAS integrity failure: expected {expected}, got {actual}")]
    CasIntegrityFailure { expected: Digest, actual: Digest },
    /// Transient transport failure that outlived the retry budget
    #[error("{operation} failed after {attempts} attempts: {source}")]
    TransientTransport {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Terminal transport failure (permission, not-found, invalid request, ...)
    #[error("{operation} failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    /// Client-side failure before submission
    #[error("local error: {0}")]
    Local(String),
    /// Some input blobs could not be stored remotely
    #[error("{failed} of {total} blobs could not be uploaded")]
    IncompleteUpload { failed: usize, total: usize },
    #[error("operation cancelled by caller")]
    Cancelled,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoExecError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Status a caller should report when this error ends an `execute` call.
    /// Everything raised before submission is a local failure.
    pub fn result_status(&self) -> ResultStatus {
        match self {
            Self::Cancelled => ResultStatus::Interrupted,
            _ => ResultStatus::LocalError,
        }
    }
}

pub type Result<T, E = MemoExecError> = std::result::Result<T, E>;

/// Helper to determine if an error is retryable
pub fn is_retryable(err: &MemoExecError) -> bool {
    match err {
        MemoExecError::TransientTransport { .. } => true,
        MemoExecError::IncompleteUpload { .. } => true,
        MemoExecError::Transport { source, .. } => source.is_transient(false),
        MemoExecError::CasIntegrityFailure { .. } => false,
        MemoExecError::Filesystem { .. } => false,
        MemoExecError::InvalidDigest(_) => false,
        MemoExecError::Local(_) => false,
        MemoExecError::Cancelled => false,
        MemoExecError::Serialization(_) => false,
    }
}

/// Retry configuration for resilient operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // Add jitter: ±20% of backoff, then clamp to max
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter)
        .max(0.0)
        .min(config.max_backoff_ms as f64) as u64
}
