//! Retry-with-backoff primitive.
//!
//! Generic over the future and the retryability predicate so it can drive both the
//! object-store client (`storage::s3`) and the metadata-store transaction manager
//! (`db::transaction`).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for a bounded retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay for a zero-indexed attempt, including jitter. Per testable property #8:
    /// `[base*2^i, base*2^i*1.1]`, clamped to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let scaled = self.base_delay.saturating_mul(exp as u32);
        let capped = std::cmp::min(scaled, self.max_delay);
        let jitter_max = capped.mul_f64(0.1);
        let jitter = if jitter_max.is_zero() {
            Duration::ZERO
        } else {
            let millis = rand::thread_rng().gen_range(0..=jitter_max.as_millis().max(1) as u64);
            Duration::from_millis(millis)
        };
        std::cmp::min(capped + jitter, self.max_delay + jitter_max)
    }
}

/// Run `op` up to `policy.max_attempts` times. `classify` decides whether a failure is
/// retryable; on a non-retryable failure, or after the final attempt, the error is
/// returned immediately. `on_retry` is an optional observer called with `(attempt, &err,
/// delay)` before sleeping.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    classify: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = classify(&err);
                let exhausted = attempt + 1 >= policy.max_attempts;
                if !retryable || exhausted {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_clamps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        let d0 = policy.delay_for_attempt(0);
        let d1 = policy.delay_for_attempt(1);
        assert!(d0.as_millis() >= 100 && d0.as_millis() <= 110);
        assert!(d1.as_millis() >= 200 && d1.as_millis() <= 220);
        let d_big = policy.delay_for_attempt(20);
        assert!(d_big <= Duration::from_secs(5) + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn stops_on_non_retryable() {
        let policy = RetryPolicy::default();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            |_attempt| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err("permanent") }
            },
            |_e| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts_then_surfaces_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            |_attempt| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err("timeout") }
            },
            |_e| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let result = retry_with_backoff(
            &policy,
            |attempt| async move {
                if attempt < 2 {
                    Err("timeout")
                } else {
                    Ok(42)
                }
            },
            |_e| true,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
