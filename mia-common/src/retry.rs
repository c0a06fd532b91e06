//! Retry-with-backoff, shared by provider HTTP calls and live-pull.
//!
//! One abstraction parametrized by attempts and backoff; retryability is
//! decided by `Error::is_retryable`, so terminal provider failures (auth,
//! bad request, invalid response) bypass retries entirely.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Base delay; attempt N waits `base * N` (linear ramp, matching the
    /// provider clients this replaces).
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: retries.saturating_add(1).max(1),
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// No retries at all; single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, the error is non-retryable, or attempts are
/// exhausted. The last error is returned as-is.
pub async fn retry_async<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<Error> = None;

    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retryable = e.is_retryable() && attempt < policy.max_attempts;
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    retryable,
                    error = %e,
                    "operation attempt failed"
                );
                if !e.is_retryable() {
                    return Err(e);
                }
                last_error = Some(e);
                if retryable && !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Internal(format!("{}: no attempts executed", label))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = retry_async(RetryPolicy::new(3, 0), "test", move || {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::provider(ProviderErrorKind::Unavailable, "500"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_bypasses_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<()> = retry_async(RetryPolicy::new(5, 0), "test", move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider(ProviderErrorKind::Auth, "401"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<()> = retry_async(RetryPolicy::new(2, 0), "test", move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider(ProviderErrorKind::Network, "connect refused"))
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::Provider { kind: ProviderErrorKind::Network, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
