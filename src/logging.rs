//! Tracing setup plus the counters and log macros the dispatcher reports through.

use crate::command::ResultStatus;
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Install the global subscriber. `RUST_LOG` wins over `verbose` when set.
pub fn init_logging(json_output: bool, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fallback = if verbose { "memoexec=debug" } else { "memoexec=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let registry = Registry::default().with(env_filter);

    if json_output {
        // One JSON object per event, spans included, for log shippers
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(verbose)
                    .with_span_events(if verbose { FmtSpan::CLOSE } else { FmtSpan::NONE }),
            )
            .try_init()?;
    }

    Ok(())
}

/// Counters for executions dispatched through one client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetrics {
    pub executions: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub remote_errors: u64,
    pub timeouts: u64,
    pub interrupted: u64,
    pub local_errors: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, status: ResultStatus) {
        self.executions += 1;
        match status {
            ResultStatus::Success => self.successes += 1,
            ResultStatus::CacheHit => self.cache_hits += 1,
            ResultStatus::RemoteError => self.remote_errors += 1,
            ResultStatus::TimeoutError => self.timeouts += 1,
            ResultStatus::Interrupted => self.interrupted += 1,
            ResultStatus::LocalError => self.local_errors += 1,
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            (self.cache_hits as f64) / (self.executions as f64)
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            ((self.successes + self.cache_hits) as f64) / (self.executions as f64)
        }
    }
}

/// Span event logging for action cache operations
#[macro_export]
macro_rules! log_cache_hit {
    ($digest:expr) => {
        tracing::debug!(action = %$digest.short(), "Action cache hit");
    };
}

#[macro_export]
macro_rules! log_cache_miss {
    ($digest:expr) => {
        tracing::debug!(action = %$digest.short(), "Action cache miss");
    };
}

#[macro_export]
macro_rules! log_cache_store {
    ($digest:expr) => {
        tracing::debug!(action = %$digest.short(), "Storing action result");
    };
}

#[macro_export]
macro_rules! log_cas_verify_fail {
    ($expected:expr, $actual:expr) => {
        tracing::error!(
            expected = %$expected,
            actual = %$actual,
            "CAS verification failed"
        );
    };
}

#[macro_export]
macro_rules! log_remote_operation {
    ($operation:expr, $status:expr, $duration_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            status = %$status,
            duration_ms = $duration_ms,
            "Remote operation completed"
        );
    };
}
