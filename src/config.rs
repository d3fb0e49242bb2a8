//! Client configuration: serde defaults, `MEMOEXEC_*` environment overlay and
//! JSON files.

use crate::constants::{
    DEFAULT_FIND_MISSING_BATCH, DEFAULT_MAX_BATCH_BLOBS, DEFAULT_MAX_BATCH_BYTES,
    DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_REMOTE_EXECUTION_TIMEOUT_SECS, DEFAULT_STREAM_CHUNK_SIZE,
};
use crate::error::{MemoExecError, Result, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Limits for the CAS transfer engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Blobs at or below this size travel in batch requests, larger ones stream
    pub max_batch_bytes: usize,
    pub max_batch_blobs: usize,
    pub stream_chunk_size: usize,
    pub max_find_missing_batch: usize,
    /// Fan-out shared by every transfer made through one client
    pub max_concurrent_transfers: usize,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_blobs: DEFAULT_MAX_BATCH_BLOBS,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            max_find_missing_batch: DEFAULT_FIND_MISSING_BATCH,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub cas: CasConfig,
    pub retry: RetryConfig,
    /// Action timeout used when a command does not set one
    pub default_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cas: CasConfig::default(),
            retry: RetryConfig::default(),
            default_timeout_secs: DEFAULT_REMOTE_EXECUTION_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn env_override<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(var = name, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with any `MEMOEXEC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| MemoExecError::filesystem(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        env_override("MEMOEXEC_MAX_BATCH_BYTES", &mut self.cas.max_batch_bytes);
        env_override("MEMOEXEC_MAX_BATCH_BLOBS", &mut self.cas.max_batch_blobs);
        env_override("MEMOEXEC_STREAM_CHUNK_SIZE", &mut self.cas.stream_chunk_size);
        env_override(
            "MEMOEXEC_MAX_CONCURRENT_TRANSFERS",
            &mut self.cas.max_concurrent_transfers,
        );
        env_override("MEMOEXEC_MAX_RETRY_ATTEMPTS", &mut self.retry.max_attempts);
        env_override("MEMOEXEC_DEFAULT_TIMEOUT_SECS", &mut self.default_timeout_secs);
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("cas.max_batch_bytes", self.cas.max_batch_bytes),
            ("cas.max_batch_blobs", self.cas.max_batch_blobs),
            ("cas.stream_chunk_size", self.cas.stream_chunk_size),
            ("cas.max_find_missing_batch", self.cas.max_find_missing_batch),
            ("cas.max_concurrent_transfers", self.cas.max_concurrent_transfers),
            ("default_timeout_secs", self.default_timeout_secs as usize),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero {
            return Err(MemoExecError::Local(format!("config value {} must be positive", name)));
        }
        if self.retry.max_attempts == 0 {
            return Err(MemoExecError::Local(
                "config value retry.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
