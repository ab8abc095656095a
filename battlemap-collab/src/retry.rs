//! Exponential backoff for reads and reconnects.
//!
//! Only [`SyncError::TransientIo`] is retried. Mutations never go through
//! here: a write that timed out may still have committed.

use std::future::Future;
use std::time::Duration;

use battlemap_core::SyncError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Total attempts including the first. `0` is treated as `1`.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Next delay after `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. Returns the last error.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{what} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    log::warn!(
                        "{what} failed (attempt {attempt}/{attempts}): {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.next_delay(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use battlemap_core::DenyReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        let mut delay = policy.initial_delay;
        for expected in [1, 2, 4, 8, 16, 30, 30] {
            assert_eq!(delay.as_secs(), expected);
            delay = policy.next_delay(delay);
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .retry("snapshot", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::TransientIo("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::TransientIo("refused".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_never_retries_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("snapshot", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Authorization(DenyReason::NotYourTurn))
            })
            .await;
        assert_eq!(result, Err(SyncError::Authorization(DenyReason::NotYourTurn)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
