use std::{future::Future, time::Duration};

use tracing::warn;

/// Runs `operation` up to `attempts` times, doubling the wait after each transient failure.
///
/// Non-transient errors are returned immediately. When the budget runs out the last error is
/// handed to `exhausted` so callers can map it into their own vocabulary.
pub async fn retry_with_backoff<T, E, Op, Fut>(
    attempts: u32,
    base_delay: Duration,
    is_transient: impl Fn(&E) -> bool,
    exhausted: impl FnOnce(E) -> E,
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) if attempt == attempts => return Err(exhausted(err)),
            Err(err) => {
                warn!("attempt {attempt}/{attempts} failed: {err}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }

    unreachable!("retry loop returns on its final attempt")
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::services::ForecastError;

    async fn run(
        failures_before_success: u32,
        error: fn() -> ForecastError,
    ) -> (Result<u32, ForecastError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(
            3,
            Duration::from_secs(1),
            ForecastError::is_transient,
            |_| ForecastError::TooManyRetries,
            || {
                let calls = calls.clone();
                async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if call > failures_before_success {
                        Ok(call)
                    } else {
                        Err(error())
                    }
                }
            },
        )
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let started = tokio::time::Instant::now();
        let (result, calls) = run(2, || ForecastError::Server(503)).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
        // 1s then 2s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_maps_to_too_many_retries() {
        let (result, calls) = run(10, || ForecastError::Network("reset".into())).await;

        assert!(matches!(result, Err(ForecastError::TooManyRetries)));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let (result, calls) = run(10, || ForecastError::NoLocation).await;

        assert!(matches!(result, Err(ForecastError::NoLocation)));
        assert_eq!(calls, 1);
    }
}
