use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

/// Retry a fallible async operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh attempt each call.
pub async fn retry<F, Fut, T>(max_attempts: u32, base_delay: Duration, label: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bounded wait for a condition: timeout plus fixed interval between checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Outcome of [`poll_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
}

/// Call `check` until it returns `Ok(true)` or the policy's deadline passes.
///
/// Errors from `check` end the wait immediately; a plain `false` sleeps one
/// interval and tries again.
pub async fn poll_until<F, Fut>(policy: PollPolicy, label: &str, check: F) -> Result<PollOutcome>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + policy.timeout;

    loop {
        if check().await? {
            return Ok(PollOutcome::Ready);
        }
        if tokio::time::Instant::now() + policy.interval > deadline {
            return Ok(PollOutcome::TimedOut);
        }
        debug!("{} not ready yet, retrying...", label);
        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry(3, Duration::from_millis(1), "test", || async { Ok::<_, anyhow::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let result = retry(3, Duration::from_millis(1), "test", || {
            let count = count.clone();
            async move {
                let c = count.fetch_add(1, Ordering::SeqCst) + 1;
                if c < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(c)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let result: Result<i32> = retry(3, Duration::from_millis(1), "test", || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(anyhow::anyhow!("always fails"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_ready() {
        let count = Arc::new(AtomicU32::new(0));
        let policy = PollPolicy::new(Duration::from_secs(5), Duration::from_millis(1));
        let outcome = poll_until(policy, "test", || {
            let count = count.clone();
            async move { Ok::<_, anyhow::Error>(count.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy = PollPolicy::new(Duration::from_millis(20), Duration::from_millis(5));
        let outcome = poll_until(policy, "test", || async { Ok::<_, anyhow::Error>(false) })
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_poll_until_propagates_errors() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_millis(1));
        let result = poll_until(policy, "test", || async {
            Err::<bool, _>(anyhow::anyhow!("unreachable"))
        }).await;
        assert!(result.is_err());
    }
}
