use super::action_cache::FakeActionCache;
use super::cas::FakeCas;
use crate::digest::Digest;
use crate::error::{Code, TransportError};
use crate::remote_exec::{
    Action, ActionResult, Directory, ExecuteRequest, ExecuteResponse, ExecutionMetadata,
    Operation, OperationResult, Status,
};
use crate::transport::TransportResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct PendingOperation {
    response: ExecuteResponse,
    ready_at: Instant,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct ExecState {
    action_result: ActionResult,
    status: Option<Status>,
    cached: bool,
    latency: Duration,
    executions: usize,
    last_action: Option<Digest>,
    operations: HashMap<String, PendingOperation>,
    cancelled: Vec<String>,
}

/// Execution service that "runs" every action by returning a configured result.
#[derive(Debug, Default)]
pub struct FakeExec {
    state: Mutex<ExecState>,
}

impl FakeExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        *self.state.lock() = ExecState::default();
    }

    pub fn set_action_result(&self, result: ActionResult) {
        self.state.lock().action_result = result;
    }

    /// Status every subsequent execution reports; `None` means OK.
    pub fn set_status(&self, status: Option<Status>) {
        self.state.lock().status = status;
    }

    /// Flag responses as served from the execution service's own cache.
    pub fn set_cached(&self, cached: bool) {
        self.state.lock().cached = cached;
    }

    pub fn is_cached(&self) -> bool {
        self.state.lock().cached
    }

    /// How long each operation stays in progress before completing.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn execution_count(&self) -> usize {
        self.state.lock().executions
    }

    pub fn last_action(&self) -> Option<Digest> {
        self.state.lock().last_action.clone()
    }

    /// Names of operations a client asked to cancel.
    pub fn cancelled_operations(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    fn decode<T: serde::de::DeserializeOwned>(cas: &FakeCas, digest: &Digest, what: &str) -> Result<T, Status> {
        let bytes = cas.get(digest).ok_or_else(|| {
            Status::new(
                Code::FailedPrecondition,
                format!("{} {} missing from CAS", what, digest),
            )
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Status::new(
                Code::InvalidArgument,
                format!("{} {} is malformed: {}", what, digest, e),
            )
        })
    }

    /// Every blob reachable from the input root must be in CAS.
    fn check_inputs(cas: &FakeCas, root: &Digest) -> Result<(), Status> {
        let mut stack = vec![root.clone()];
        while let Some(digest) = stack.pop() {
            let dir: Directory = Self::decode(cas, &digest, "directory")?;
            for file in &dir.files {
                if !cas.contains(&file.digest) {
                    return Err(Status::new(
                        Code::FailedPrecondition,
                        format!("input {} ({}) missing from CAS", file.name, file.digest),
                    ));
                }
            }
            stack.extend(dir.directories.into_iter().map(|d| d.digest));
        }
        Ok(())
    }

    fn run(&self, action_digest: &Digest, cas: &FakeCas) -> ExecuteResponse {
        let action: Action = match Self::decode(cas, action_digest, "action") {
            Ok(action) => action,
            Err(status) => return failed_response(status),
        };
        if !cas.contains(&action.command_digest) {
            return failed_response(Status::new(
                Code::FailedPrecondition,
                format!("command {} missing from CAS", action.command_digest),
            ));
        }
        if let Err(status) = Self::check_inputs(cas, &action.input_root_digest) {
            return failed_response(status);
        }

        let state = self.state.lock();
        let now = chrono::Utc::now().timestamp_millis();
        let mut result = state.action_result.clone();
        result.execution_metadata = ExecutionMetadata {
            worker: "fake-worker".to_string(),
            queued_timestamp: Some(now),
            worker_start_timestamp: Some(now),
            worker_completed_timestamp: Some(now + state.latency.as_millis() as i64),
        };
        ExecuteResponse {
            result: Some(result),
            cached_result: state.cached,
            status: state.status.clone().unwrap_or_else(Status::ok),
            message: String::new(),
        }
    }

    pub fn execute(
        &self,
        request: ExecuteRequest,
        cas: &FakeCas,
        action_cache: &FakeActionCache,
    ) -> TransportResult<Operation> {
        {
            let mut state = self.state.lock();
            state.executions += 1;
            state.last_action = Some(request.action_digest.clone());
        }

        let cached = if request.skip_cache_lookup {
            None
        } else {
            action_cache.get(&request.action_digest)
        };
        let response = match cached {
            Some(result) => ExecuteResponse {
                result: Some(result),
                cached_result: true,
                status: Status::ok(),
                message: String::new(),
            },
            None => self.run(&request.action_digest, cas),
        };

        let name = format!("operations/{}", Uuid::new_v4());
        let mut state = self.state.lock();
        let ready_at = Instant::now() + state.latency;
        state.operations.insert(
            name.clone(),
            PendingOperation {
                response,
                ready_at,
                cancelled: false,
            },
        );
        drop(state);
        self.poll(&name)
    }

    /// Current view of an operation.
    pub fn poll(&self, name: &str) -> TransportResult<Operation> {
        let state = self.state.lock();
        let op = state
            .operations
            .get(name)
            .ok_or_else(|| TransportError::new(Code::NotFound, format!("no operation {}", name)))?;
        if op.cancelled {
            return Ok(Operation {
                name: name.to_string(),
                done: true,
                result: Some(OperationResult::Error(Status::new(
                    Code::Cancelled,
                    "operation cancelled",
                ))),
            });
        }
        if Instant::now() < op.ready_at {
            return Ok(Operation {
                name: name.to_string(),
                done: false,
                result: None,
            });
        }
        Ok(Operation {
            name: name.to_string(),
            done: true,
            result: Some(OperationResult::Response(op.response.clone())),
        })
    }

    /// Time left before `name` completes; zero when it is done or unknown.
    pub fn remaining(&self, name: &str) -> Duration {
        self.state
            .lock()
            .operations
            .get(name)
            .filter(|op| !op.cancelled)
            .map(|op| op.ready_at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    pub fn cancel(&self, name: &str) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.cancelled.push(name.to_string());
        match state.operations.get_mut(name) {
            Some(op) => {
                op.cancelled = true;
                Ok(())
            }
            None => Err(TransportError::new(
                Code::NotFound,
                format!("no operation {}", name),
            )),
        }
    }
}

fn failed_response(status: Status) -> ExecuteResponse {
    ExecuteResponse {
        result: None,
        cached_result: false,
        message: status.message.clone(),
        status,
    }
}
