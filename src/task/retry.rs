//! Stage-level retry for backend calls
//!
//! The engine never retries on its own. Drivers wrap individual backend calls
//! in a `StageRetry` so that a transient provider error does not fail the
//! whole task.

use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with a fixed attempt cap
#[derive(Debug, Clone)]
pub struct StageRetry {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for StageRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl StageRetry {
    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Run `call` until it succeeds, fails permanently, or runs out of attempts
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        backoff::future::retry(policy, || {
            attempt += 1;
            let current = attempt;
            let fut = call();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        debug!(
                            operation,
                            attempt = current,
                            error = %e,
                            "Retrying backend call"
                        );
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::<Error>::permanent(e)),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> StageRetry {
        StageRetry {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            multiplier: 1.5,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = fast(5)
            .run("create_vm", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::backend("aliyun", "create_vm", "throttled"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_at_attempt_cap() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(3)
            .run("create_vm", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::backend("aliyun", "create_vm", "down"))
            })
            .await;

        assert!(matches!(result, Err(Error::BackendFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(5)
            .run("resize_disk", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ValidationFailed("too small".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::ValidationFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
