use std::future::Future;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use snafu::Snafu;
use tracing::{debug, warn};

#[derive(Debug, Snafu)]
pub enum ProviderRaceError {
    #[snafu(display(
        "All providers failed for {operation} after {rounds} round(s): {details}"
    ))]
    AllProvidersFailed {
        operation: String,
        rounds: u32,
        details: String,
    },
}

pub type Result<T, E = ProviderRaceError> = std::result::Result<T, E>;

/// Retry envelope for a full multi-provider round.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional rounds after the first; each round races every provider.
    pub max_retries: u32,
    /// Fixed delay between rounds.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Race one attempt per provider concurrently; the first `Ok` wins. If a
/// whole round fails, sleep `retry_delay` and run another round, up to
/// `max_retries` extra rounds. Provider errors are strings on purpose: they
/// are diagnostics for the aggregate error, not values to branch on.
pub async fn race_providers<T, F, Fut>(
    operation: &str,
    provider_count: usize,
    policy: &RetryPolicy,
    make_attempt: F,
) -> Result<T>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = std::result::Result<T, String>>,
{
    let mut failures: Vec<String> = Vec::new();
    let total_rounds = policy.max_retries + 1;

    for round in 0..total_rounds {
        if round > 0 {
            tokio::time::sleep(policy.retry_delay).await;
        }

        let mut in_flight: FuturesUnordered<_> =
            (0..provider_count).map(|i| attempt_tagged(i, make_attempt(i))).collect();

        while let Some((provider_idx, result)) = in_flight.next().await {
            match result {
                Ok(value) => {
                    debug!(operation, provider_idx, round, "provider race won");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(operation, provider_idx, round, error = %e, "provider attempt failed");
                    failures.push(format!("provider[{provider_idx}] round {round}: {e}"));
                }
            }
        }
    }

    AllProvidersFailedSnafu {
        operation: operation.to_string(),
        rounds: total_rounds,
        details: failures.join("; "),
    }
    .fail()
}

async fn attempt_tagged<T, Fut>(
    idx: usize,
    fut: Fut,
) -> (usize, std::result::Result<T, String>)
where
    Fut: Future<Output = std::result::Result<T, String>>,
{
    (idx, fut.await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn first_ok_wins() {
        let policy = RetryPolicy::default();
        let result = race_providers("test", 2, &policy, |i| async move {
            if i == 0 {
                Err("down".to_string())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn retries_whole_round_then_fails() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        };
        let err = race_providers::<u32, _, _>("test", 2, &policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await
        .unwrap_err();

        // 2 providers x 3 rounds
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(err.to_string().contains("after 3 round(s)"));
    }

    #[tokio::test]
    async fn later_round_can_succeed() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
        };
        let result = race_providers("test", 1, &policy, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("transient".to_string())
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "ok");
    }
}
