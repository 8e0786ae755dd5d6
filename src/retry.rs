//! Conflict Retry
//!
//! Every write to a Drive or Volume is a read-modify-write cycle checked by
//! the store's resource version. On conflict the whole cycle is repeated
//! with a fresh read, under exponential backoff and a fixed attempt budget.

use crate::error::{Error, Result};
use crate::metrics;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounds for conflict retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_interval: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            max_interval: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is spent
///
/// `op` must perform the full read-modify-write cycle; it is invoked again
/// from scratch after every conflict. Exhaustion is reported as
/// [`Error::RetryExhausted`].
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    kind: &str,
    name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_multiplier(policy.multiplier)
        .with_max_interval(policy.max_interval)
        .with_randomization_factor(0.1)
        .with_max_elapsed_time(None)
        .build();

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    backoff::future::retry(backoff, || {
        attempt += 1;
        let current = attempt;
        let kind = kind.to_string();
        let name = name.to_string();
        let fut = op();

        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(err) if err.is_conflict() => {
                    metrics::record_conflict();
                    if current >= max_attempts {
                        return Err(backoff::Error::permanent(Error::RetryExhausted {
                            kind,
                            name,
                            attempts: current,
                        }));
                    }
                    debug!(kind = %kind, name = %name, attempt = current, "write conflict, retrying");
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            multiplier: 1.5,
            max_interval: Duration::from_millis(5),
        }
    }

    fn conflict() -> Error {
        Error::Conflict {
            kind: "Drive".into(),
            name: "d1".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&fast_policy(5), "Drive", "d1", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&fast_policy(3), "Drive", "d1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;

        assert_matches!(result, Err(Error::RetryExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&fast_policy(5), "Volume", "v1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::ResourceNotFound {
                kind: "Volume".into(),
                name: "v1".into(),
            })
        })
        .await;

        assert_matches!(result, Err(Error::ResourceNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
