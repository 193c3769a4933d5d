// Retry loop shared by part uploads, the merge call and ranged downloads.

use crate::error::TransferError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long to wait before the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// `base * 2^n`, capped at `cap`, plus up to `base / 2` of jitter when enabled.
    Exponential {
        base: Duration,
        cap: Duration,
        jitter: bool,
    },
}

/// Number of retries allowed after the first attempt, and the wait between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Jittered exponential backoff bounded by `cap`.
    pub fn exponential(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                base,
                cap,
                jitter: true,
            },
        }
    }

    /// Delay slept after the failure of attempt `attempt` (0-indexed).
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap, jitter } => {
                let factor = 2u32.saturating_pow(attempt);
                let delay = base.checked_mul(factor).map_or(cap, |d| d.min(cap));
                if !jitter {
                    return delay;
                }
                let headroom = cap.saturating_sub(delay).min(base / 2);
                let headroom_ms = headroom.as_millis() as u64;
                if headroom_ms == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rand::rng().random_range(0..headroom_ms))
            }
        }
    }
}

/// Verdict of one attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Failed, worth another attempt.
    Retry(TransferError),
    /// Failed for good.
    Fail(TransferError),
}

impl<T> RetryAction<T> {
    /// Classify with [`TransferError::is_retryable`].
    pub fn from_result(result: Result<T, TransferError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Attempts actually made.
    pub attempts: u32,
    /// Error of the last attempt, or `Cancelled`.
    pub error: TransferError,
}

/// Run `operation` until it succeeds, fails for good or the policy runs out.
///
/// `operation` receives the 0-indexed attempt number. Cancelling `token`
/// stops the loop before the next attempt and interrupts the backoff sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let cancelled = |attempts| RetryExhausted {
        attempts,
        error: TransferError::Cancelled,
    };

    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(cancelled(attempt));
        }

        let error = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(error) => {
                return Err(RetryExhausted {
                    attempts: attempt + 1,
                    error,
                });
            }
            RetryAction::Retry(error) if attempt == policy.max_retries => {
                return Err(RetryExhausted {
                    attempts: attempt + 1,
                    error,
                });
            }
            RetryAction::Retry(error) => error,
        };

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            retry = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(cancelled(attempt + 1)),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // The last iteration always returns.
    Err(cancelled(policy.max_retries + 1))
}
