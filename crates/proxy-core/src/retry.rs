//! Shared retry/backoff policy: max 3 attempts, exponential backoff
//! starting at 1s, factor 2, capped at 30s, ±50% jitter. Used by the upstream
//! tunnel connector and by DNS upstream queries so both share one
//! implementation instead of each building its own backoff loop.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;

/// Runs `op` up to `max_attempts` times, honoring the standard backoff curve.
/// `is_retryable` decides whether a given error is worth retrying at all;
/// non-retryable errors surface immediately instead of burning attempts.
pub async fn with_backoff<T, E, F, Fut, R>(max_attempts: usize, mut op: F, is_retryable: R) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(30))
        .with_randomization_factor(0.5)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts || !is_retryable(&e) => return Err(e),
            Err(_) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, &'static str> = with_backoff(
            3,
            move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("refused")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<(), &'static str> = with_backoff(
            3,
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("refused")
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("refused"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<(), &'static str> = with_backoff(
            3,
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("permission denied")
                }
            },
            |e| *e != "permission denied",
        )
        .await;
        assert_eq!(result, Err("permission denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
