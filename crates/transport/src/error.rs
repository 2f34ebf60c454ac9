//! Transport Error Types
//!
//! Anything that goes wrong between the consumer loop and the broker. Stage
//! handlers can't fail, so none of these concern message content except
//! [`ErrorKind::Encoding`], which is per message.

use derive_more::{Display, Error};
use std::time::Duration;
use trawl_retry::Retryable;

/// A transport error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The broker could not be reached
    #[display("cannot connect to broker: {_0}")]
    Connect(#[error(not(source))] String),
    /// The broker refused or failed an operation on an open connection
    #[display("broker error: {_0}")]
    Broker(#[error(not(source))] String),
    /// The task that owns the broker connection is gone
    #[display("transport task has stopped")]
    Stopped,
    /// A message body couldn't be encoded or decoded
    #[display("bad message encoding: {_0}")]
    Encoding(#[error(not(source))] String),
    #[display("timed out after {_0:?}")]
    Timeout(#[error(not(source))] Duration),
}

impl Retryable for ErrorKind {
    fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connect(_))
    }

    fn timed_out(after: Duration) -> Self {
        ErrorKind::Timeout(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connecting_is_retried() {
        assert!(ErrorKind::Connect("refused".into()).is_retryable());
        assert!(!ErrorKind::Broker("channel closed".into()).is_retryable());
        assert!(!ErrorKind::Stopped.is_retryable());
    }
}
