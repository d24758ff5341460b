//! Bounded exponential backoff for object-source calls.

use std::future::Future;
use std::time::Duration;

use prov_core::config::PrefillConfig;
use tracing::warn;

use crate::source::{SourceError, SourceResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    starting_interval: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 5)
    }
}

impl RetryPolicy {
    pub fn new(starting_interval: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            starting_interval,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &PrefillConfig) -> Self {
        let secs = |v: f64| Duration::try_from_secs_f64(v).unwrap_or_default();
        Self::new(
            secs(config.network_retry_starting_interval_secs),
            secs(config.network_retry_max_delay_secs),
            config.network_retry_max_attempts,
        )
    }

    /// Wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.starting_interval
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> SourceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, ?delay, error = %e, "object source call failed, retrying");
                    tokio::time::sleep(delay).await;
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
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> SourceError {
        SourceError::Status {
            url: "http://udm/".into(),
            status: 503,
        }
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 10);
        let delays: Vec<_> = (1..=5).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 5, 5]);
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&PrefillConfig::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let out = policy
            .run("types", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        let err = policy
            .run("types", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run("object", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::Format {
                    url: "http://udm/x".into(),
                    reason: "not an object".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
