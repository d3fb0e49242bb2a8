//! Caller-facing command description and execution result.

use crate::digest::Digest;
use crate::error::{MemoExecError, Result};
use crate::remote_exec::{self, ActionResult, EnvironmentVariable, PlatformProperty};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Optional labels carried into logs for correlating a command with the tool
/// that issued it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub invocation_id: String,
    #[serde(default)]
    pub tool_name: String,
}

/// A command to run remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub identifiers: Identifiers,
    pub args: Vec<String>,
    /// Local directory all input paths are relative to
    pub exec_root: PathBuf,
    /// Relative to the exec root; empty means the root itself
    #[serde(default)]
    pub working_dir: String,
    /// Relative to the working directory
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub platform: BTreeMap<String, String>,
    /// Upper bound on remote execution; the client default applies when unset
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(args: Vec<String>, exec_root: impl Into<PathBuf>) -> Self {
        Self {
            args,
            exec_root: exec_root.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.args.is_empty() {
            return Err(MemoExecError::Local("command has no arguments".to_string()));
        }
        if self.exec_root.as_os_str().is_empty() {
            return Err(MemoExecError::Local("command has no exec root".to_string()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(MemoExecError::Local("command timeout must be positive".to_string()));
        }
        crate::tree::normalize_path(&self.working_dir)?;
        for output in &self.output_files {
            crate::tree::normalize_path(output)?;
        }
        Ok(())
    }

    /// The canonical wire form: environment, platform and outputs sorted.
    pub fn to_wire(&self) -> remote_exec::Command {
        let mut output_files = self.output_files.clone();
        output_files.sort();
        output_files.dedup();
        remote_exec::Command {
            arguments: self.args.clone(),
            environment_variables: self
                .env
                .iter()
                .map(|(name, value)| EnvironmentVariable {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            output_files,
            working_directory: self.working_dir.clone(),
            platform: self
                .platform
                .iter()
                .map(|(name, value)| PlatformProperty {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

/// Per-call execution switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Consult the action cache before submitting. `false` forces a remote run.
    pub accept_cached: bool,
    /// Never read or write the action cache for this action
    pub do_not_cache: bool,
    /// Materialize output files under the exec root once the action succeeds
    pub download_outputs: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            accept_cached: true,
            do_not_cache: false,
            download_outputs: false,
        }
    }
}

impl ExecutionOptions {
    pub fn force_remote() -> Self {
        Self {
            accept_cached: false,
            ..Self::default()
        }
    }

    pub fn should_lookup_cache(&self) -> bool {
        self.accept_cached && !self.do_not_cache
    }
}

/// Outcome kind of one execution attempt. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    CacheHit,
    TimeoutError,
    RemoteError,
    LocalError,
    Interrupted,
}

impl ResultStatus {
    /// Whether the action ran (or was found cached) to completion.
    pub fn is_ok(self) -> bool {
        matches!(self, ResultStatus::Success | ResultStatus::CacheHit)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::CacheHit => "CACHE_HIT",
            ResultStatus::TimeoutError => "TIMEOUT",
            ResultStatus::RemoteError => "REMOTE_ERROR",
            ResultStatus::LocalError => "LOCAL_ERROR",
            ResultStatus::Interrupted => "INTERRUPTED",
        };
        f.write_str(s)
    }
}

/// Result of one `execute` call. Outputs are referenced by digest and only
/// fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,
    pub exit_code: i32,
    /// Set once the action was prepared
    pub action_digest: Option<Digest>,
    /// What the remote side (or the action cache) reported
    pub action_result: Option<ActionResult>,
    /// Human-readable failure detail for non-OK statuses
    pub error: Option<String>,
}

impl CommandResult {
    pub fn completed(status: ResultStatus, action_digest: Digest, action_result: ActionResult) -> Self {
        Self {
            status,
            exit_code: action_result.exit_code,
            action_digest: Some(action_digest),
            action_result: Some(action_result),
            error: None,
        }
    }

    pub fn failed(status: ResultStatus, action_digest: Option<Digest>, error: impl Into<String>) -> Self {
        Self {
            status,
            exit_code: -1,
            action_digest,
            action_result: None,
            error: Some(error.into()),
        }
    }

    /// Remote failure that still carries a partial action result.
    pub fn remote_error(action_digest: Digest, action_result: Option<ActionResult>, error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::RemoteError,
            exit_code: action_result.as_ref().map(|r| r.exit_code).unwrap_or(-1),
            action_digest: Some(action_digest),
            action_result,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn output_files(&self) -> &[remote_exec::OutputFile] {
        self.action_result
            .as_ref()
            .map(|r| r.output_files.as_slice())
            .unwrap_or(&[])
    }
}

/// Something a result refers to that can be fetched from CAS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRef {
    Stdout,
    Stderr,
    /// An output file, by the path the command declared
    File(String),
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputRef::Stdout => f.write_str("stdout"),
            OutputRef::Stderr => f.write_str("stderr"),
            OutputRef::File(path) => write!(f, "output file {}", path),
        }
    }
}
