//! Retry policies for operations against slow or flaky backends.
//!
//! Three policies share one entry point, [`Retrier::run`]:
//!
//! - [`Backoff`] reruns an operation that fails with a retryable error,
//!   sleeping `base * 2^min(n, ceiling)` (optionally jittered) after the
//!   `n`th failure, counted from zero;
//! - [`TimeoutRetrier`] does the same but bounds the *total* wall-clock time
//!   spent across all attempts;
//! - [`Retrier::Dummy`] runs the operation exactly once.
//!
//! Operations return `Result<T, exn::Exn<K>>`; the kind `K` decides whether
//! a failure is worth retrying through the [`Retryable`] trait.

mod backoff;
mod timeout;

pub use crate::backoff::Backoff;
pub use crate::timeout::TimeoutRetrier;
use exn::Exn;
use std::future::Future;
use std::time::Duration;

/// Error kinds that can be classified for retrying.
pub trait Retryable: std::error::Error + Send + Sync + Sized + 'static {
    /// Returns `true` if running the same operation again might succeed.
    fn is_retryable(&self) -> bool;

    /// The kind used to report that a time budget ran out.
    fn timed_out(after: Duration) -> Self;
}

/// A retry policy chosen at runtime.
#[derive(Clone, Debug)]
pub enum Retrier {
    /// Run once, never sleep.
    Dummy,
    Backoff(Backoff),
    Timeout(TimeoutRetrier),
}

impl Default for Retrier {
    fn default() -> Self {
        Retrier::Backoff(Backoff::default())
    }
}

impl Retrier {
    /// Run `op` under this policy, retrying whatever the error kind itself
    /// considers retryable.
    pub async fn run<T, K, F, Fut>(&self, op: F) -> Result<T, Exn<K>>
    where
        K: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Exn<K>>>,
    {
        self.run_if(op, K::is_retryable).await
    }

    /// Run `op` under this policy, retrying only errors accepted by
    /// `retryable`.
    pub async fn run_if<T, K, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, Exn<K>>
    where
        K: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Exn<K>>>,
        P: Fn(&K) -> bool,
    {
        match self {
            Retrier::Dummy => op().await,
            Retrier::Backoff(backoff) => backoff.run_if(op, retryable).await,
            Retrier::Timeout(timeout) => timeout.run_if(op, retryable).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::Retryable;
    use derive_more::{Display, Error};
    use std::time::Duration;

    #[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
    pub enum FlakyKind {
        #[display("busy")]
        Busy,
        #[display("broken")]
        Broken,
        #[display("timed out after {_0:?}")]
        TimedOut(#[error(not(source))] Duration),
    }

    impl Retryable for FlakyKind {
        fn is_retryable(&self) -> bool {
            matches!(self, FlakyKind::Busy)
        }

        fn timed_out(after: Duration) -> Self {
            FlakyKind::TimedOut(after)
        }
    }
}
