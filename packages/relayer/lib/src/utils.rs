//! This module contains the polling utilities shared by the chain client.

use futures_timer::Delay;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::ChainError;

/// Retries an operation until the condition is met or a timeout occurs.
///
/// The condition is checked once before the first sleep.
///
/// # Errors
/// Returns the first error of `condition`, or [`ChainError::WaitTimeout`] if the condition
/// is not met within the timeout.
pub async fn wait_for_condition<F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) -> Result<(), ChainError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool, ChainError>> + Send,
{
    poll_until(what, timeout, interval, || {
        let met = condition();
        async move { Ok(met.await?.then_some(())) }
    })
    .await
}

/// Polls `poll` until it yields a value or a timeout occurs.
///
/// # Errors
/// Returns the first error of `poll`, or [`ChainError::WaitTimeout`] if nothing is
/// yielded within the timeout.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut poll: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>, ChainError>> + Send,
{
    let start = Instant::now();
    loop {
        if let Some(value) = poll().await? {
            return Ok(value);
        }
        if start.elapsed() >= timeout {
            return Err(ChainError::WaitTimeout {
                what: what.to_string(),
                timeout,
            });
        }

        tracing::trace!(
            "Waiting for {what}. Retrying in {} ms",
            interval.as_millis()
        );
        Delay::new(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        wait_for_condition("third call", Duration::from_secs(5), Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_condition_never_holds() {
        let err = wait_for_condition(
            "nothing",
            Duration::from_millis(20),
            Duration::from_millis(5),
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn propagates_condition_errors() {
        let err = wait_for_condition("error", Duration::from_secs(1), Duration::from_millis(1), || async {
            Err(ChainError::Rpc("node down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::Rpc(_)));
    }

    #[tokio::test]
    async fn poll_returns_the_first_value() {
        let calls = AtomicU32::new(0);
        let value = poll_until("second call", Duration::from_secs(5), Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n == 1).then_some(n * 10)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 10);
    }
}
