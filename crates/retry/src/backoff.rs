use crate::Retryable;
use exn::Exn;
use futures::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff.
///
/// No sleep precedes the first attempt. After the `n`th failure (counted
/// from zero) the retrier sleeps for `base * 2^min(n, ceiling)`, adjusted by
/// a random amount of up to `±fuzz` of that delay. Once `max_tries` attempts
/// have failed, the last error is returned.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    count: u32,
    max_tries: u32,
    ceiling: u32,
    base: Duration,
    warn_after: Option<u32>,
    fuzz: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            count: 0,
            max_tries: 10,
            ceiling: 7,
            base: Duration::from_secs(1),
            warn_after: Some(6),
            fuzz: 0.0,
        }
    }
}

impl Backoff {
    /// Start counting failures from `count` instead of zero, so that a
    /// second run continues with the delays where the first left off.
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    pub fn ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Sub-10ms bases are raised to 10ms.
    pub fn base(mut self, base: Duration) -> Self {
        self.base = base.max(Duration::from_millis(10));
        self
    }

    /// Log a warning once this many failures have happened. `None` never
    /// warns.
    pub fn warn_after(mut self, warn_after: Option<u32>) -> Self {
        self.warn_after = warn_after;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn fuzz(mut self, fuzz: f64) -> Self {
        self.fuzz = fuzz.clamp(0.0, 1.0);
        self
    }

    /// Upper bound of attempts made by [`run`](Self::run).
    pub fn tries(&self) -> u32 {
        self.max_tries
    }

    /// The undithered delay after failure `n`.
    pub fn delay(&self, n: u32) -> Duration {
        let exponent = n.min(self.ceiling).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }

    fn jittered(&self, n: u32) -> Duration {
        let delay = self.delay(n);
        if self.fuzz == 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.fuzz;
        let adjustment = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + adjustment).max(0.0))
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
        self.run_with_sleep(op, retryable, |d| Box::pin(tokio::time::sleep(d))).await
    }

    pub(crate) async fn run_with_sleep<T, K, F, Fut, P, S>(
        &self,
        mut op: F,
        retryable: P,
        mut sleep: S,
    ) -> Result<T, Exn<K>>
    where
        K: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Exn<K>>>,
        P: Fn(&K) -> bool,
        S: FnMut(Duration) -> BoxFuture<'static, ()>,
    {
        let mut failures = 0u32;
        loop {
            if failures > 0 {
                sleep(self.jittered(self.count + failures - 1)).await;
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !retryable(&err) {
                return Err(err);
            }
            failures += 1;
            let warn = self.warn_after.is_some_and(|w| failures >= w);
            if failures >= self.max_tries {
                if warn {
                    tracing::warn!(failures, error = %*err, "giving up after repeated failures");
                }
                return Err(err);
            }
            if warn {
                let delay = self.delay(self.count + failures - 1);
                tracing::warn!(failures, delay = ?delay, error = %*err, "operation keeps failing, backing off");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyKind;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<Duration>>>, impl FnMut(Duration) -> BoxFuture<'static, ()>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sink = slept.clone();
        (slept, move |d| {
            sink.lock().unwrap().push(d);
            Box::pin(async {})
        })
    }

    #[rstest]
    #[case(0, Duration::from_secs(1))]
    #[case(1, Duration::from_secs(2))]
    #[case(3, Duration::from_secs(8))]
    #[case(7, Duration::from_secs(128))]
    #[case(12, Duration::from_secs(128))]
    fn test_delay(#[case] n: u32, #[case] expected: Duration) {
        assert_eq!(Backoff::default().delay(n), expected);
    }

    #[tokio::test]
    async fn test_always_failing_sleeps_between_attempts_only() {
        let (slept, sleep) = recorder();
        let backoff = Backoff::default().max_tries(3);
        let result: Result<(), Exn<FlakyKind>> = backoff
            .run_with_sleep(|| async { Err(Exn::from(FlakyKind::Busy)) }, FlakyKind::is_retryable, sleep)
            .await;
        assert_eq!(*result.unwrap_err(), FlakyKind::Busy);
        let slept = slept.lock().unwrap();
        assert_eq!(slept.len(), 2);
        assert!(slept.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_success_never_sleeps() {
        let (slept, sleep) = recorder();
        let result: Result<u8, Exn<FlakyKind>> = Backoff::default()
            .run_with_sleep(|| async { Ok(7) }, FlakyKind::is_retryable, sleep)
            .await;
        assert_eq!(result.unwrap(), 7);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_is_returned_immediately() {
        let (slept, sleep) = recorder();
        let result: Result<(), Exn<FlakyKind>> = Backoff::default()
            .run_with_sleep(|| async { Err(Exn::from(FlakyKind::Broken)) }, FlakyKind::is_retryable, sleep)
            .await;
        assert_eq!(*result.unwrap_err(), FlakyKind::Broken);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fuzz_stays_within_bounds() {
        let (slept, sleep) = recorder();
        let backoff = Backoff::default().max_tries(6).fuzz(0.5);
        let _: Result<(), Exn<FlakyKind>> = backoff
            .run_with_sleep(|| async { Err(Exn::from(FlakyKind::Busy)) }, FlakyKind::is_retryable, sleep)
            .await;
        for (n, d) in slept.lock().unwrap().iter().enumerate() {
            let nominal = backoff.delay(n as u32).as_secs_f64();
            assert!(d.as_secs_f64() >= nominal * 0.5 - 1e-9);
            assert!(d.as_secs_f64() <= nominal * 1.5 + 1e-9);
        }
    }

    #[tokio::test]
    async fn test_count_continues_schedule() {
        let (slept, sleep) = recorder();
        let backoff = Backoff::default().count(2).max_tries(2);
        let _: Result<(), Exn<FlakyKind>> = backoff
            .run_with_sleep(|| async { Err(Exn::from(FlakyKind::Busy)) }, FlakyKind::is_retryable, sleep)
            .await;
        assert_eq!(*slept.lock().unwrap(), vec![Duration::from_secs(4)]);
    }
}
