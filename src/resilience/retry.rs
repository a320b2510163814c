//! Retry with exponential backoff and jitter.

use crate::errors::is_transient;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Default retry attempts per operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default initial backoff (500ms).
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default backoff ceiling (30s).
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Backoff policy for one class of operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Jitter fraction: each sleep is scaled by a factor in [1-jitter, 1+jitter].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying transient failures up to `max_attempts` total
    /// attempts. Permanent failures and successes return immediately.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !is_transient(&err) {
                        return Err(err);
                    }
                    let delay = self.backoff_for(attempt - 1);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Backoff for the nth retry (0-based): `min(initial × multiplier^n, max)`
    /// scaled by the jitter factor.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped * self.jitter_factor())
    }

    /// A factor in [1-jitter, 1+jitter], derived from the clock's
    /// sub-second noise.
    fn jitter_factor(&self) -> f64 {
        if self.jitter <= 0.0 {
            return 1.0;
        }
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let unit = f64::from(nanos) / f64::from(u32::MAX); // [0, 1)
        1.0 + self.jitter * (2.0 * unit - 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LlmError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(8),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_grows_geometrically_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        // 400 would exceed the cap
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.backoff_for(0).as_secs_f64();
            let base = policy.initial_backoff.as_secs_f64();
            assert!(d >= base * 0.8 - f64::EPSILON);
            assert!(d <= base * 1.2 + f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_transient_failure() {
        let calls = AtomicU32::new(0);
        let out: Result<()> = no_jitter(3)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::Error::new(LlmError::Server { status: 502 }))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_returns_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let out: Result<()> = no_jitter(5)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("config error"))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn immediate_success_does_not_sleep() {
        let out = no_jitter(3).run(|| async { Ok::<_, anyhow::Error>(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }
}
