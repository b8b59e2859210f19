//! The default retry policy applied to CI API calls and cache pushes:
//! exponential backoff with full jitter, capped, with a fixed attempt
//! budget. Only transient failures are retried.

use crate::api::ApiError;
use anyhow::Result;
use derive_builder::Builder;
use getset::CopyGetters;
use log::warn;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time;

#[derive(Builder, Clone, CopyGetters, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Backoff parameters shared by every retried operation.
pub struct RetryPolicy {
    #[get_copy = "pub"]
    /// Total number of attempts, including the first one.
    max_attempts: u32,

    #[get_copy = "pub"]
    /// Backoff unit; attempt `n` backs off up to `base * 2^n`.
    base: Duration,

    #[get_copy = "pub"]
    /// Upper bound for a single backoff interval.
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Full-jitter delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let ceiling = self
            .base()
            .checked_mul(factor)
            .unwrap_or_else(|| self.cap())
            .min(self.cap());
        let millis = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Run `op` under the policy. Transient failures back off and retry until
/// the attempt budget is spent; permanent failures return immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ ApiError::Permanent(_)) => return Err(err.into()),
            Err(err @ ApiError::Transient(_)) => {
                attempt += 1;
                if attempt >= policy.max_attempts() {
                    return Err(err.into());
                }
                let delay = policy.delay(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    what,
                    attempt,
                    policy.max_attempts(),
                    delay.as_millis(),
                    err
                );
                time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicyBuilder::default()
            .max_attempts(3u32)
            .base(Duration::from_millis(1))
            .cap(Duration::from_millis(4))
            .build()
            .expect("retry policy")
    }

    #[test]
    fn delay_success_bounded_by_cap() {
        let policy = quick_policy();
        for attempt in 0..10 {
            assert!(policy.delay(attempt) <= policy.cap());
        }
    }

    #[tokio::test]
    async fn retries_success_after_transients() -> Result<()> {
        let calls = AtomicU32::new(0);
        let res = with_retries(&quick_policy(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await?;

        assert_eq!(res, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn retries_failure_permanent_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = with_retries(&quick_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Permanent("403".into())) }
        })
        .await;

        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_failure_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = with_retries(&quick_policy(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Transient("io".into())) }
        })
        .await;

        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
