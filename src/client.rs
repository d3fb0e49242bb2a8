//! Caller-facing entry point.

use crate::blob::Blob;
use crate::cas::{CasClient, UploadReport};
use crate::command::{Command, CommandResult, ExecutionOptions, OutputRef};
use crate::config::ClientConfig;
use crate::digest::Digest;
use crate::error::Result;
use crate::executor::Dispatcher;
use crate::logging::ExecutionMetrics;
use crate::transport::{HttpTransport, Transport};
use crate::tree::{InputSpec, InputTree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A remote execution client. Cheap to clone; clones share the transfer
/// limiter and metrics.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    dispatcher: Dispatcher,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let cas = CasClient::new(transport, config.cas.clone(), config.retry.clone());
        let dispatcher = Dispatcher::new(
            cas,
            config.retry.clone(),
            config.default_timeout(),
            config.poll_interval(),
        );
        Ok(Self { config, dispatcher })
    }

    /// Client talking JSON over HTTP to `endpoint`.
    pub fn connect(endpoint: &str, config: ClientConfig) -> Result<Self> {
        Self::new(Arc::new(HttpTransport::new(endpoint)?), config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cas(&self) -> &CasClient {
        self.dispatcher.cas()
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.dispatcher.metrics()
    }

    pub async fn execute(
        &self,
        command: &Command,
        input_spec: &InputSpec,
        options: &ExecutionOptions,
    ) -> Result<CommandResult> {
        self.execute_with_cancel(command, input_spec, options, &CancellationToken::new())
            .await
    }

    /// Like [`Client::execute`]; cancelling `cancel` aborts this call only.
    pub async fn execute_with_cancel(
        &self,
        command: &Command,
        input_spec: &InputSpec,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        self.dispatcher
            .execute(command, input_spec, options, cancel)
            .await
    }

    pub async fn fetch_output(&self, result: &CommandResult, output: &OutputRef) -> Result<Vec<u8>> {
        self.dispatcher
            .fetch_output(result, output, &CancellationToken::new())
            .await
    }

    pub async fn download_outputs(&self, result: &CommandResult, dest: &Path) -> Result<Vec<PathBuf>> {
        self.dispatcher
            .download_outputs(result, dest, &CancellationToken::new())
            .await
    }

    pub fn build_tree(&self, exec_root: &Path, input_spec: &InputSpec) -> Result<InputTree> {
        crate::tree::build_tree(exec_root, input_spec)
    }

    pub async fn find_missing(&self, digests: &[Digest]) -> Result<HashSet<Digest>> {
        self.cas()
            .find_missing(digests, &CancellationToken::new())
            .await
    }

    pub async fn upload(
        &self,
        blobs: &HashMap<Digest, Blob>,
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        self.cas().upload(blobs, cancel).await
    }

    pub async fn download(
        &self,
        digests: &[Digest],
        cancel: &CancellationToken,
    ) -> Result<HashMap<Digest, Blob>> {
        self.cas().download(digests, cancel).await
    }
}
