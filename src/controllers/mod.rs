pub mod cluster_controller;
pub mod grouping;
pub mod join;
pub mod launch;
pub mod readiness;

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub use cluster_controller::{ClusterController, CreateOptions};
pub use grouping::{group_clusters, ClusterSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Attempts(u32),
    Deadline(Duration),
}

// How often to poll and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub limit: RetryLimit,
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            limit: RetryLimit::Attempts(max_attempts),
        }
    }

    pub fn deadline(deadline: Duration, interval: Duration) -> Self {
        Self {
            interval,
            limit: RetryLimit::Deadline(deadline),
        }
    }
}

// Runs `check` until it yields a value, the policy is exhausted (`Ok(None)`)
// or `cancel` fires (`Err(Cancelled)`). The first check runs immediately.
// Errors from `check` abort the loop. A deadline also cuts short a check
// that is still in flight.
pub async fn poll_until<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let expires = match policy.limit {
        RetryLimit::Deadline(deadline) => Some(started + deadline),
        RetryLimit::Attempts(_) => None,
    };
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(expires.unwrap_or(started)), if expires.is_some() => return Ok(None),
            outcome = check() => outcome?,
        };
        if outcome.is_some() {
            return Ok(outcome);
        }

        let wait = match policy.limit {
            RetryLimit::Attempts(max) => {
                if attempt >= max {
                    return Ok(None);
                }
                policy.interval
            }
            RetryLimit::Deadline(deadline) => {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Ok(None);
                }
                policy.interval.min(deadline - elapsed)
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::attempts(5, Duration::from_millis(1));
        let result = poll_until(policy, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then_some(n))
            }
        })
        .await
        .unwrap();
        assert_eq!(result, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::attempts(4, Duration::from_millis(1));
        let result: Option<()> = poll_until(policy, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await
        .unwrap();
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_deadline_exhausted() {
        let policy = RetryPolicy::deadline(Duration::from_millis(30), Duration::from_millis(5));
        let result: Option<()> = poll_until(policy, &CancellationToken::new(), || async { Ok(None) })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_deadline_interrupts_hung_check() {
        let policy = RetryPolicy::deadline(Duration::from_millis(50), Duration::from_millis(5));
        let start = std::time::Instant::now();
        let result: Option<()> = poll_until(policy, &CancellationToken::new(), || async {
            sleep(Duration::from_secs(10)).await;
            Ok(None)
        })
        .await
        .unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::deadline(Duration::from_secs(60), Duration::from_secs(1));
        let err = poll_until::<(), _, _>(policy, &cancel, || async { Ok(None) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_check_error_aborts() {
        let policy = RetryPolicy::attempts(10, Duration::from_millis(1));
        let err = poll_until::<(), _, _>(policy, &CancellationToken::new(), || async {
            Err(Error::engine("fake", "boom"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Engine { .. }));
    }
}
