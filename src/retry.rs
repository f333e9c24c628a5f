//! Exponential backoff for broker (re)connection.
//!
//! The connection pool opens connections lazily. When a connection dies it is
//! evicted and the next acquisition opens a replacement through
//! [`retry_with_backoff`], so a broker that is briefly unreachable does not
//! immediately fail every caller.
//!
//! Only [`RpcError::TransportRetryable`](crate::RpcError::TransportRetryable)
//! is retried; everything else fails fast.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use tokio::time::sleep;

use crate::{log_debug, log_warn, Result, RpcError};

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 = single attempt).
    pub max_attempts: u32,

    /// Factor applied to the delay after each retry.
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// 3 retries, doubling from 100ms, capped at 5s.
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        // ---
        let mut delay = self.initial_delay;
        for _ in 1..retry {
            delay = Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier as f64)
                .min(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Run `operation`, retrying retryable failures according to `retry_config`.
///
/// `None` runs the operation exactly once. `what` names the operation in logs.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    // ---
    let Some(cfg) = retry_config else {
        return operation().await;
    };

    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(RpcError::TransportRetryable(details)) if retry < cfg.max_attempts => {
                retry += 1;
                let delay = apply_jitter(cfg.delay_for(retry));
                log_debug!(
                    "{what}: retry {retry}/{} in {delay:?} ({details})",
                    cfg.max_attempts
                );
                sleep(delay).await;
            }
            Err(RpcError::TransportRetryable(details)) => {
                log_warn!("{what}: giving up after {} retries: {details}", cfg.max_attempts);
                return Err(RpcError::TransportRetryable(details));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Scale `delay` by a random factor in `0.75..=1.25`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let factor = 0.75 + ((hash % 1000) as f64 / 1000.0) * 0.5;
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn delay_schedule_grows_and_caps() {
        // ---
        let cfg = RetryConfig {
            max_attempts: 10,
            multiplier: 3.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(cfg.delay_for(1), Duration::from_millis(10));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(30));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(90));
        assert_eq!(cfg.delay_for(4), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(9), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        // ---
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(75), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(125), "{jittered:?}");
        }
    }

    #[tokio::test]
    async fn none_config_runs_once() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_with_backoff(None, "test", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::TransportRetryable("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(RpcError::TransportRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_until_success() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_with_backoff(Some(&fast()), "test", || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(RpcError::TransportRetryable("down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_retryable_error() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_with_backoff(Some(&fast()), "test", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::TransportRetryable("down".into())) }
        })
        .await;

        assert!(matches!(result, Err(RpcError::TransportRetryable(_))));
        // first attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_with_backoff(Some(&fast()), "test", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::Transport("refused".into())) }
        })
        .await;

        assert!(matches!(result, Err(RpcError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
