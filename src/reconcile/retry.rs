//! Bounded retry.
//!
//! The only place the engine sleeps between remote attempts. Callers
//! describe one attempt, the policy decides how many and how far apart.

use crate::venue::VenueError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt count and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_millis(attempts: u32, delay_ms: u64) -> Self {
        Self::new(attempts, Duration::from_millis(delay_ms))
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Not settled yet; the string says why.
    Retry(String),
}

/// Run `op` until it returns [`Attempt::Done`] or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. Returns `None` when every
/// attempt asked for a retry.
pub async fn retry_until<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    for attempt in 1..=policy.attempts {
        match op(attempt).await {
            Attempt::Done(value) => return Some(value),
            Attempt::Retry(reason) => {
                debug!(
                    operation,
                    attempt,
                    max_attempts = policy.attempts,
                    %reason,
                    "Attempt not settled"
                );
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    warn!(operation, attempts = policy.attempts, "Retries exhausted");
    None
}

/// Retry a venue call on transient errors only.
///
/// Structural errors (rejections, invalid requests) return immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.attempts,
                    error = %e,
                    "Transient venue error, retrying"
                );
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = retry_until(RetryPolicy::from_millis(3, 2000), "lookup", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 2 {
                    Attempt::Done(attempt)
                } else {
                    Attempt::Retry("not yet".into())
                }
            }
        })
        .await;

        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_exhausts_with_fixed_delay() {
        let start = Instant::now();
        let result: Option<()> = retry_until(RetryPolicy::from_millis(3, 2000), "lookup", |_| async {
            Attempt::Retry("never".into())
        })
        .await;

        assert!(result.is_none());
        // Two sleeps between three attempts
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_skips_structural_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), VenueError> =
            retry_transient(RetryPolicy::from_millis(3, 100), "submit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(VenueError::Rejected {
                        reason: "reduce only".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(RetryPolicy::from_millis(3, 100), "balance", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VenueError::Unavailable("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }

    #[test]
    fn test_policy_has_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }
}
