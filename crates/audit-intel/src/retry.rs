//! Timeout and bounded exponential-backoff retry for backend calls.
//!
//! Used by the embedding pipeline and the vector index decorator. Each
//! attempt runs under `timeout`; a timed-out attempt is converted into the
//! caller's unavailable error and treated like any other retryable failure.
//!
//! Backoff before attempt `n` (1-based) is `base × 2^(n-1)`, with the
//! exponent capped at 5.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use audit_intel_core::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
///
/// `on_timeout` builds the error reported for an attempt that exceeded
/// the policy's timeout.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    on_timeout: fn(String) -> Error,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }

        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => on_timeout(format!("{what} timed out after {:?}", policy.timeout)),
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        warn!(attempt, max_retries = policy.max_retries, error = %err, "{what} failed, retrying");
    }
}
