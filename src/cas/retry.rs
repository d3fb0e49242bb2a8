//! Bounded retry around single transport calls.

use crate::error::{calculate_backoff, MemoExecError, Result, RetryConfig, TransportError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Race `fut` against the caller's cancellation signal.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MemoExecError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Sleep for the backoff of `attempt`, waking early on cancellation.
pub async fn backoff(attempt: u32, config: &RetryConfig, cancel: &CancellationToken) -> Result<()> {
    let delay = Duration::from_millis(calculate_backoff(attempt, config));
    cancellable(cancel, tokio::time::sleep(delay)).await
}

/// Run `call` until it succeeds, fails terminally, or the attempt budget is
/// spent. Only transient codes are retried; `idempotent` decides whether a
/// deadline expiry counts as transient.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    idempotent: bool,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match cancellable(cancel, call()).await? {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient(idempotent) => {
                return Err(MemoExecError::Transport {
                    operation: operation.to_string(),
                    source: err,
                });
            }
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(MemoExecError::TransientTransport {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Transient transport failure, retrying"
                );
                backoff(attempt - 1, config, cancel).await?;
            }
        }
    }
}
