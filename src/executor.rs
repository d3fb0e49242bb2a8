//! Execution dispatcher: prepare the Action, consult the action cache, make
//! sure inputs are in CAS, submit, await and classify the outcome.

use crate::blob::Blob;
use crate::cas::retry::with_retry;
use crate::cas::CasClient;
use crate::command::{Command, CommandResult, ExecutionOptions, OutputRef, ResultStatus};
use crate::digest::Digest;
use crate::error::{Code, MemoExecError, Result, RetryConfig};
use crate::logging::ExecutionMetrics;
use crate::remote_exec::{
    self, Action, ActionResult, CancelOperationRequest, ExecuteRequest, GetActionResultRequest,
    Operation, OperationResult, UpdateActionResultRequest, WaitExecutionRequest,
};
use crate::transport::Transport;
use crate::tree::{build_tree, InputSpec};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Wire-level Command and Action for one execution, with their digests.
/// Built once; never mutated after the digests are taken.
#[derive(Debug, Clone)]
pub struct PreparedAction {
    pub command: remote_exec::Command,
    pub command_digest: Digest,
    pub action: Action,
    pub action_digest: Digest,
    command_blob: Blob,
    action_blob: Blob,
}

impl PreparedAction {
    /// The Command and Action messages as CAS blobs.
    pub fn blobs(&self) -> [(Digest, Blob); 2] {
        [
            (self.command_digest.clone(), self.command_blob.clone()),
            (self.action_digest.clone(), self.action_blob.clone()),
        ]
    }
}

/// Build the Action for `command` over an input root.
pub fn prepare_action(
    command: &Command,
    input_root: &Digest,
    options: &ExecutionOptions,
) -> Result<PreparedAction> {
    let wire = command.to_wire();
    let (command_digest, command_bytes) = Digest::of_message(&wire)?;
    let action = Action {
        command_digest: command_digest.clone(),
        input_root_digest: input_root.clone(),
        timeout: command.timeout,
        do_not_cache: options.do_not_cache,
    };
    let (action_digest, action_bytes) = Digest::of_message(&action)?;
    Ok(PreparedAction {
        command: wire,
        command_digest,
        action,
        action_digest,
        command_blob: Blob::from_bytes(command_bytes),
        action_blob: Blob::from_bytes(action_bytes),
    })
}

/// How the Await step ended.
enum AwaitOutcome {
    Finished(Operation),
    Failed(MemoExecError),
    TimedOut,
    Interrupted,
}

/// Map a terminal operation to exactly one result status.
pub fn classify(action_digest: Digest, operation: Operation) -> CommandResult {
    match operation.result {
        None => CommandResult::remote_error(
            action_digest,
            None,
            format!("operation {} finished without a result", operation.name),
        ),
        Some(OperationResult::Error(status)) if status.code == Code::DeadlineExceeded => {
            CommandResult::failed(
                ResultStatus::TimeoutError,
                Some(action_digest),
                status.message,
            )
        }
        Some(OperationResult::Error(status)) => CommandResult::remote_error(
            action_digest,
            None,
            format!("{}: {}", status.code, status.message),
        ),
        Some(OperationResult::Response(response)) if !response.status.is_ok() => {
            let detail = format!("{}: {}", response.status.code, response.status.message);
            if response.status.code == Code::DeadlineExceeded {
                let mut result = CommandResult::remote_error(action_digest, response.result, detail);
                result.status = ResultStatus::TimeoutError;
                result
            } else {
                CommandResult::remote_error(action_digest, response.result, detail)
            }
        }
        Some(OperationResult::Response(response)) => match response.result {
            None => CommandResult::remote_error(
                action_digest,
                None,
                "execution response carried no action result",
            ),
            Some(result) if response.cached_result => {
                CommandResult::completed(ResultStatus::CacheHit, action_digest, result)
            }
            Some(result) => CommandResult::completed(ResultStatus::Success, action_digest, result),
        },
    }
}

/// Runs commands against a remote execution service.
#[derive(Clone)]
pub struct Dispatcher {
    cas: CasClient,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    default_timeout: Duration,
    poll_interval: Duration,
    metrics: Arc<Mutex<ExecutionMetrics>>,
}

impl Dispatcher {
    pub fn new(
        cas: CasClient,
        retry: RetryConfig,
        default_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport: cas.transport().clone(),
            cas,
            retry,
            default_timeout,
            poll_interval,
            metrics: Arc::new(Mutex::new(ExecutionMetrics::new())),
        }
    }

    pub fn cas(&self) -> &CasClient {
        &self.cas
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics.lock().clone()
    }

    /// Execute `command` remotely.
    ///
    /// Failures before submission come back as `Err`; anything that is a
    /// property of the action itself (remote error, timeout, interruption
    /// while waiting) is an `Ok` result carrying that status.
    #[instrument(skip_all, fields(command_id = %command.identifiers.command_id, action = tracing::field::Empty))]
    pub async fn execute(
        &self,
        command: &Command,
        input_spec: &InputSpec,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let outcome = self.run(command, input_spec, options, cancel).await;
        let status = match &outcome {
            Ok(result) => result.status,
            Err(err) => err.result_status(),
        };
        self.metrics.lock().record(status);
        outcome
    }

    async fn run(
        &self,
        command: &Command,
        input_spec: &InputSpec,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let start = Instant::now();
        command.validate()?;

        // Prepare
        let exec_root = command.exec_root.clone();
        let spec = input_spec.clone();
        let tree = tokio::task::spawn_blocking(move || build_tree(&exec_root, &spec))
            .await
            .map_err(|e| MemoExecError::Local(format!("tree builder task failed: {}", e)))??;
        let prepared = prepare_action(command, &tree.root_digest, options)?;
        let action_digest = prepared.action_digest.clone();
        tracing::Span::current().record("action", action_digest.short());
        info!(
            args = ?command.args,
            input_root = %tree.root_digest,
            files = tree.file_count,
            "Prepared action"
        );

        // CacheLookup
        if options.should_lookup_cache() {
            if let Some(cached) = self.lookup_cache(&action_digest, cancel).await? {
                crate::log_cache_hit!(action_digest);
                let result = CommandResult::completed(ResultStatus::CacheHit, action_digest, cached);
                return Ok(self.maybe_download(command, options, result, cancel).await);
            }
            crate::log_cache_miss!(action_digest);
        }

        // EnsureInputsPresent
        let mut blobs = tree.blobs;
        blobs.extend(prepared.blobs());
        let report = self.cas.upload(&blobs, cancel).await?;
        self.metrics.lock().bytes_uploaded += report.bytes_uploaded;
        for digest in report.failed() {
            if let Some(crate::cas::UploadOutcome::Failed(failure)) = report.outcomes.get(digest) {
                warn!(digest = %digest, failure = %failure, "Input not stored remotely");
            }
        }
        report.ensure_complete()?;

        // Submit
        let request = ExecuteRequest {
            action_digest: action_digest.clone(),
            skip_cache_lookup: !options.should_lookup_cache(),
        };
        let operation = match with_retry("execute", &self.retry, false, cancel, || {
            self.transport.execute(request.clone())
        })
        .await
        {
            Ok(op) => op,
            Err(MemoExecError::Cancelled) => return Err(MemoExecError::Cancelled),
            Err(err) => {
                let result = CommandResult::remote_error(
                    action_digest,
                    None,
                    format!("submission failed: {}", err),
                );
                return Ok(result);
            }
        };
        let operation_name = operation.name.clone();
        debug!(operation = %operation_name, "Action submitted");

        // Await
        let timeout = command.timeout.unwrap_or(self.default_timeout);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => AwaitOutcome::Interrupted,
            waited = tokio::time::timeout(timeout, self.await_operation(operation)) => match waited {
                Err(_) => AwaitOutcome::TimedOut,
                Ok(Ok(op)) => AwaitOutcome::Finished(op),
                Ok(Err(err)) => AwaitOutcome::Failed(err),
            },
        };

        // Classify
        let mut result = match outcome {
            AwaitOutcome::Finished(op) => classify(action_digest.clone(), op),
            AwaitOutcome::Failed(err) => CommandResult::remote_error(
                action_digest.clone(),
                None,
                format!("waiting for operation failed: {}", err),
            ),
            AwaitOutcome::TimedOut => {
                self.cancel_in_background(operation_name);
                CommandResult::failed(
                    ResultStatus::TimeoutError,
                    Some(action_digest.clone()),
                    format!("action timed out after {:?}", timeout),
                )
            }
            AwaitOutcome::Interrupted => {
                self.cancel_in_background(operation_name);
                CommandResult::failed(
                    ResultStatus::Interrupted,
                    Some(action_digest.clone()),
                    "execution interrupted by caller",
                )
            }
        };

        // CacheWrite
        if result.status == ResultStatus::Success && result.exit_code == 0 && !options.do_not_cache {
            if let Some(action_result) = &result.action_result {
                self.write_cache(&action_digest, action_result, cancel).await;
            }
        }

        // FetchOutputs, only when asked up front
        result = self.maybe_download(command, options, result, cancel).await;

        info!(
            status = %result.status,
            exit_code = result.exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Execution finished"
        );
        Ok(result)
    }

    async fn lookup_cache(
        &self,
        action_digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Option<ActionResult>> {
        let request = GetActionResultRequest {
            action_digest: action_digest.clone(),
        };
        match with_retry("get_action_result", &self.retry, true, cancel, || {
            self.transport.get_action_result(request.clone())
        })
        .await
        {
            Ok(found) => Ok(found),
            Err(MemoExecError::Cancelled) => Err(MemoExecError::Cancelled),
            Err(err) => {
                warn!(error = %err, "Action cache lookup failed, treating as a miss");
                Ok(None)
            }
        }
    }

    /// Best effort: a failed write never changes the result.
    async fn write_cache(
        &self,
        action_digest: &Digest,
        action_result: &ActionResult,
        cancel: &CancellationToken,
    ) {
        crate::log_cache_store!(action_digest);
        let request = UpdateActionResultRequest {
            action_digest: action_digest.clone(),
            action_result: action_result.clone(),
        };
        if let Err(err) = with_retry("update_action_result", &self.retry, true, cancel, || {
            self.transport.update_action_result(request.clone())
        })
        .await
        {
            warn!(action = %action_digest.short(), error = %err, "Action cache write failed");
        }
    }

    async fn await_operation(&self, mut operation: Operation) -> Result<Operation> {
        // Cancellation is handled by the caller's select.
        let never = CancellationToken::new();
        while !operation.done {
            tokio::time::sleep(self.poll_interval).await;
            let request = WaitExecutionRequest {
                name: operation.name.clone(),
            };
            operation = with_retry("wait_execution", &self.retry, true, &never, || {
                self.transport.wait_execution(request.clone())
            })
            .await?;
        }
        Ok(operation)
    }

    fn cancel_in_background(&self, name: String) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let request = CancelOperationRequest { name: name.clone() };
            if let Err(err) = transport.cancel_operation(request).await {
                debug!(operation = %name, error = %err, "Best-effort cancel failed");
            }
        });
    }

    async fn maybe_download(
        &self,
        command: &Command,
        options: &ExecutionOptions,
        mut result: CommandResult,
        cancel: &CancellationToken,
    ) -> CommandResult {
        if !options.download_outputs || !result.is_ok() || result.output_files().is_empty() {
            return result;
        }
        let dest = command.exec_root.join(&command.working_dir);
        if let Err(err) = self.download_outputs(&result, &dest, cancel).await {
            warn!(error = %err, "Downloading outputs failed");
            result.status = ResultStatus::LocalError;
            result.error = Some(format!("downloading outputs failed: {}", err));
        }
        result
    }

    /// Bytes of one output, from inline data when present, else from CAS.
    pub async fn fetch_output(
        &self,
        result: &CommandResult,
        output: &OutputRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let action_result = result.action_result.as_ref().ok_or_else(|| {
            MemoExecError::Local(format!("result has no action result to fetch {} from", output))
        })?;
        let (raw, digest) = match output {
            OutputRef::Stdout => (&action_result.stdout_raw, action_result.stdout_digest.as_ref()),
            OutputRef::Stderr => (&action_result.stderr_raw, action_result.stderr_digest.as_ref()),
            OutputRef::File(path) => {
                let file = action_result
                    .output_files
                    .iter()
                    .find(|f| &f.path == path)
                    .ok_or_else(|| MemoExecError::Local(format!("no {} in result", output)))?;
                return self.fetch_one(&file.digest, cancel).await;
            }
        };
        if !raw.is_empty() {
            return Ok(raw.clone());
        }
        match digest {
            Some(digest) => self.fetch_one(digest, cancel).await,
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_one(&self, digest: &Digest, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut blobs = self.cas.download([digest], cancel).await?;
        let blob = blobs
            .remove(digest)
            .ok_or_else(|| MemoExecError::Local(format!("blob {} not returned", digest)))?;
        self.metrics.lock().bytes_downloaded += blob.size() as u64;
        blob.read_all()
    }

    /// Write every output file of `result` below `dest`. Returns the paths written.
    pub async fn download_outputs(
        &self,
        result: &CommandResult,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let outputs = result.output_files();
        let blobs = self
            .cas
            .download(outputs.iter().map(|o| &o.digest), cancel)
            .await?;

        let mut written = Vec::with_capacity(outputs.len());
        for output in outputs {
            let parts = crate::tree::normalize_path(&output.path)?;
            let path = parts.iter().fold(dest.to_path_buf(), |p, part| p.join(part));
            let blob = blobs.get(&output.digest).ok_or_else(|| {
                MemoExecError::Local(format!("output {} was not downloaded", output.path))
            })?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| MemoExecError::filesystem(parent, e))?;
            }
            std::fs::write(&path, blob.read_all()?).map_err(|e| MemoExecError::filesystem(&path, e))?;
            self.metrics.lock().bytes_downloaded += blob.size() as u64;
            #[cfg(unix)]
            if output.is_executable {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .map_err(|e| MemoExecError::filesystem(&path, e))?;
            }
            debug!(path = %path.display(), digest = %output.digest.short(), "Output written");
            written.push(path);
        }
        Ok(written)
    }
}
