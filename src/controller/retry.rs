//! # Conflict Retry
//!
//! Re-read-modify-write loops for objects that race with other writers.
//! Only optimistic-concurrency conflicts are retried; every other error is
//! returned on the spot.

use crate::controller::store::StoreError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that can tell an optimistic-concurrency conflict apart
pub trait ConflictError: std::fmt::Display {
    fn is_conflict(&self) -> bool;
}

impl ConflictError for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

/// Bounded exponential backoff with jitter
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::DEFAULT_CONFLICT_RETRY_ATTEMPTS,
            initial_delay: Duration::from_millis(crate::constants::DEFAULT_CONFLICT_RETRY_INITIAL_MS),
            max_delay: Duration::from_millis(crate::constants::DEFAULT_CONFLICT_RETRY_MAX_MS),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No sleeping between attempts, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// Run `operation` until it succeeds, fails with something other than a
/// conflict, or `config.max_attempts` is used up.
///
/// `operation` must re-read the object on every call; retrying a write with a
/// stale `resourceVersion` just conflicts again.
pub async fn retry_on_conflict<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ConflictError,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt = attempt, "Succeeded after conflict retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "Write conflicted, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: "Secret".to_string(),
            key: "ns1/t1-default-cluster-config".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let result: Result<i32, StoreError> = retry_on_conflict(&RetryConfig::immediate(5), "op", || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let result: Result<(), StoreError> = retry_on_conflict(&RetryConfig::immediate(3), "op", || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let result: Result<(), StoreError> = retry_on_conflict(&RetryConfig::immediate(5), "op", || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Backend("boom".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
