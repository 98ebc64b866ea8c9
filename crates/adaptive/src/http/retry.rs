// Retry with exponential backoff for chunk transfers and playlist refreshes.
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds random jitter of [0, base_delay/2), never past `max_delay`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // attempts >= 32 saturate instead of overflowing the shift
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Outcome of one attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure; the operation is attempted again after a delay.
    Retry(TransportError),
    Fail(TransportError),
}

impl<T> From<Result<T, TransportError>> for RetryAction<T> {
    fn from(result: Result<T, TransportError>) -> Self {
        match result {
            Ok(value) => RetryAction::Success(value),
            Err(err) if err.is_retryable() => RetryAction::Retry(err),
            Err(err) => RetryAction::Fail(err),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, exhausts the
/// policy or `token` is cancelled. The closure receives the attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, TransportError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };
        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Connect, timeout, request, body and decode failures are transient;
/// redirect loops and builder errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            jitter: false,
        }
    }

    fn bad_gateway() -> TransportError {
        TransportError::http_status(StatusCode::BAD_GATEWAY, "http://cdn/seg.ts", "segment")
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter: false,
        };
        let delays: Vec<_> = (0..5).map(|a| policy.delay_for_attempt(a).as_millis()).collect();
        assert_eq!(delays, [250, 500, 1000, 2000, 2000]);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn jitter_never_passes_the_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(900),
            jitter: true,
        };
        for attempt in 0..4 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_millis(900), "{delay:?}");
        }
        let first = policy.delay_for_attempt(0);
        assert!(first >= Duration::from_millis(400) && first < Duration::from_millis(600));
    }

    #[test]
    fn transport_results_map_to_actions() {
        assert!(matches!(RetryAction::from(Ok::<_, TransportError>(7u8)), RetryAction::Success(7)));
        assert!(matches!(
            RetryAction::<()>::from(Err(bad_gateway())),
            RetryAction::Retry(_)
        ));
        assert!(matches!(
            RetryAction::<()>::from(Err(TransportError::NotFound {
                url: "http://cdn/gone.ts".to_string()
            })),
            RetryAction::Fail(_)
        ));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let body = retry_with_backoff(&fast(3), &token, |attempt| {
            calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 2 {
                    RetryAction::Retry(bad_gateway())
                } else {
                    RetryAction::Success("payload")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(body, "payload");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_last_retry() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast(1), &token, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(bad_gateway()) }
        })
        .await;
        assert!(matches!(result, Err(TransportError::HttpStatus { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast(5), &token, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Success(()) }
        })
        .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }
}
