use crate::{Backoff, Retryable};
use exn::Exn;
use std::future::Future;
use std::time::Duration;

/// [`Backoff`] with a wall-clock budget shared by every attempt and every
/// sleep between attempts.
///
/// When the budget runs out the in-flight attempt is dropped and
/// [`Retryable::timed_out`] is returned. Work that has been moved onto a
/// blocking thread keeps running until it finishes on its own.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeoutRetrier {
    backoff: Backoff,
    budget: Duration,
}

impl TimeoutRetrier {
    pub fn new(budget: Duration, max_tries: u32) -> Self {
        Self { backoff: Backoff::default().max_tries(max_tries), budget }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub async fn run<T, K, F, Fut>(&self, op: F) -> Result<T, Exn<K>>
    where
        K: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Exn<K>>>,
    {
        self.run_if(op, K::is_retryable).await
    }

    pub async fn run_if<T, K, F, Fut, P>(&self, op: F, retryable: P) -> Result<T, Exn<K>>
    where
        K: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Exn<K>>>,
        P: Fn(&K) -> bool,
    {
        match tokio::time::timeout(self.budget, self.backoff.run_if(op, retryable)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(budget = ?self.budget, "operation exceeded its time budget");
                Err(Exn::from(K::timed_out(self.budget)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let retrier = TimeoutRetrier::new(Duration::from_secs(5), 3);
        let result: Result<(), Exn<FlakyKind>> = retrier
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(*result.unwrap_err(), FlakyKind::TimedOut(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_covers_backoff_sleeps() {
        // Attempts are instant but the sleeps (1s, 2s, 4s...) exhaust 5s.
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retrier = TimeoutRetrier::new(Duration::from_secs(5), 10);
        let result: Result<(), Exn<FlakyKind>> = retrier
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Exn::from(FlakyKind::Busy))
            })
            .await;
        assert!(matches!(*result.unwrap_err(), FlakyKind::TimedOut(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_success_passes_through() {
        let retrier = TimeoutRetrier::new(Duration::from_secs(5), 3);
        let result: Result<&str, Exn<FlakyKind>> = retrier.run(|| async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }
}
