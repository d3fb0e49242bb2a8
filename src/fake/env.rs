use super::FakeServer;
use crate::client::Client;
use crate::command::{Command, ExecutionOptions, ResultStatus};
use crate::config::ClientConfig;
use crate::digest::Digest;
use crate::error::{Code, MemoExecError, Result, RetryConfig};
use crate::executor::prepare_action;
use crate::remote_exec::{ActionResult, OutputFile, Status};
use crate::tree::{build_tree, InputSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// What the fake should report for the next execution.
///
/// Each shaping method returns a new value; they apply in call order.
#[derive(Debug, Clone)]
pub struct FakeResult {
    status: ResultStatus,
    action_result: ActionResult,
    remote_status: Option<Status>,
    output_blobs: Vec<Vec<u8>>,
    cached: bool,
}

impl FakeResult {
    pub fn new(status: ResultStatus, exit_code: i32) -> Self {
        Self {
            status,
            action_result: ActionResult {
                exit_code,
                ..Default::default()
            },
            remote_status: None,
            output_blobs: Vec::new(),
            cached: false,
        }
    }

    pub fn success(exit_code: i32) -> Self {
        Self::new(ResultStatus::Success, exit_code)
    }

    /// An output file whose content is stored in CAS.
    pub fn output_file(self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.with_output(path.into(), contents.into(), false)
    }

    pub fn executable_output_file(self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.with_output(path.into(), contents.into(), true)
    }

    fn with_output(mut self, path: String, contents: Vec<u8>, is_executable: bool) -> Self {
        self.action_result.output_files.push(OutputFile {
            path,
            digest: Digest::of_bytes(&contents),
            is_executable,
        });
        self.output_blobs.push(contents);
        self
    }

    /// Stdout stored in CAS and referenced by digest.
    pub fn stdout(mut self, contents: impl Into<Vec<u8>>) -> Self {
        let contents = contents.into();
        self.action_result.stdout_digest = Some(Digest::of_bytes(&contents));
        self.output_blobs.push(contents);
        self
    }

    /// Stdout inlined in the action result.
    pub fn stdout_raw(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.action_result.stdout_raw = contents.into();
        self
    }

    pub fn stderr(mut self, contents: impl Into<Vec<u8>>) -> Self {
        let contents = contents.into();
        self.action_result.stderr_digest = Some(Digest::of_bytes(&contents));
        self.output_blobs.push(contents);
        self
    }

    pub fn stderr_raw(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.action_result.stderr_raw = contents.into();
        self
    }

    /// Have the execution service itself answer from its cache.
    pub fn execution_cache_hit(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    /// Status reported for a `RemoteError` result; defaults to INTERNAL.
    pub fn remote_status(mut self, status: Status) -> Self {
        self.remote_status = Some(status);
        self
    }

    pub fn action_result(&self) -> &ActionResult {
        &self.action_result
    }
}

/// A temp exec root, a fake server and a client wired to it.
pub struct TestEnv {
    exec_root: TempDir,
    pub server: Arc<FakeServer>,
    pub client: Client,
}

impl TestEnv {
    /// Short poll and backoff intervals so tests stay fast.
    pub fn test_config() -> ClientConfig {
        ClientConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                backoff_multiplier: 2.0,
            },
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    pub fn new() -> Result<Self> {
        Self::with_config(Self::test_config())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let exec_root = TempDir::new()
            .map_err(|e| MemoExecError::filesystem(std::env::temp_dir(), e))?;
        let server = Arc::new(FakeServer::new());
        let client = Client::new(server.clone(), config)?;
        Ok(Self {
            exec_root,
            server,
            client,
        })
    }

    pub fn exec_root(&self) -> &Path {
        self.exec_root.path()
    }

    pub fn command(&self, args: &[&str]) -> Command {
        Command::new(
            args.iter().map(|a| a.to_string()).collect(),
            self.exec_root(),
        )
    }

    /// Write a file under the exec root, creating parent directories.
    pub fn write_file(&self, rel: &str, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.exec_root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoExecError::filesystem(parent, e))?;
        }
        std::fs::write(&path, contents).map_err(|e| MemoExecError::filesystem(&path, e))?;
        Ok(path)
    }

    /// Configure the fake to answer `command` with `result`. Returns the
    /// command and action digests, computed the way the dispatcher does.
    pub fn set(
        &self,
        command: &Command,
        input_spec: &InputSpec,
        options: &ExecutionOptions,
        result: FakeResult,
    ) -> Result<(Digest, Digest)> {
        let tree = build_tree(&command.exec_root, input_spec)?;
        let prepared = prepare_action(command, &tree.root_digest, options)?;

        for blob in &result.output_blobs {
            self.server.cas.put(blob);
        }
        let exec = &self.server.exec;
        exec.set_action_result(result.action_result.clone());
        exec.set_cached(result.cached);
        match result.status {
            ResultStatus::Success => exec.set_status(None),
            ResultStatus::TimeoutError => {
                exec.set_status(Some(Status::new(Code::DeadlineExceeded, "timeout")))
            }
            ResultStatus::RemoteError => exec.set_status(Some(
                result
                    .remote_status
                    .unwrap_or_else(|| Status::new(Code::Internal, "remote error")),
            )),
            ResultStatus::CacheHit => {
                exec.set_status(None);
                if !result.cached {
                    // A cache hit without the execution flag means the action cache answers.
                    self.server
                        .action_cache
                        .seed(prepared.action_digest.clone(), result.action_result);
                }
            }
            ResultStatus::LocalError | ResultStatus::Interrupted => {
                return Err(MemoExecError::Local(format!(
                    "the fake cannot produce a {} result",
                    result.status
                )));
            }
        }
        Ok((prepared.command_digest, prepared.action_digest))
    }
}
