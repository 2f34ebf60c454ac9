//! Compression Error Types

use crate::Compression;
use derive_more::{Display, Error};

/// A compression error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for compression operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input isn't a valid stream of this format, or is truncated
    #[display("corrupt {_0} stream")]
    Corrupt(#[error(not(source))] Compression),
    /// Writing the output failed
    #[display("cannot write {_0} output")]
    Write(#[error(not(source))] Compression),
}

impl ErrorKind {
    /// Corrupt input stays corrupt. A failed write may have been the disk's
    /// fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Write(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::Corrupt(Compression::Xz).to_string(), "corrupt xz stream");
        assert!(!ErrorKind::Corrupt(Compression::Gzip).is_retryable());
        assert!(ErrorKind::Write(Compression::Gzip).is_retryable());
    }
}
