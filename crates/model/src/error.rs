//! Model Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. The kinds fall into three groups:
//! backend failures (`NotFound`, `Unauthorized`, `Unavailable`, `Http`, ...),
//! decoding failures (`Deserialize`, `UnknownType`) and per-object content
//! failures (`InvalidData`, `Compression`).

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::time::Duration;
use trawl_compress::error::{Error as CompressionError, ErrorKind as CompressionErrorKind};
use trawl_retry::Retryable;

/// A model error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The object does not exist at the backend
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The backend refused access to the object
    #[display("permission denied: {_0}")]
    PermissionDenied(#[error(not(source))] String),
    /// Authentication was rejected, or no credentials were available
    #[display("authentication rejected: {_0}")]
    Unauthorized(#[error(not(source))] String),
    /// The server could not be contacted at all
    #[display("unreachable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The server answered with an unexpected HTTP status
    #[display("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    /// Transport-level network error
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Content is corrupt or not in the expected format
    #[display("invalid data: {_0}")]
    InvalidData(#[error(not(source))] String),
    /// A JSON object could not be turned into a model object
    #[display("malformed object: {_0}")]
    Deserialize(#[error(not(source))] String),
    /// No decoder is registered for a type label
    #[display("unknown type label: {_0}")]
    UnknownType(#[error(not(source))] String),
    /// No derived source is registered for a MIME type
    #[display("no handler for MIME type: {_0}")]
    UnsupportedMime(#[error(not(source))] String),
    /// Deriving another source would exceed the nesting limit
    #[display("nesting limit of {_0} exceeded")]
    NestingTooDeep(#[error(not(source))] usize),
    /// Compression/decompression error
    #[display("compression error: {_0}")]
    Compression(CompressionErrorKind),
    /// An operation ran out of time
    #[display("timed out after {_0:?}")]
    Timeout(#[error(not(source))] Duration),
    /// A source's open state was not of the type its resources expect
    #[display("unexpected state type for {_0} source")]
    StateType(#[error(not(source))] &'static str),
}

impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Convert a compression error into a model error, keeping the compress
    /// crate's frame as a child in the error tree.
    #[track_caller]
    pub fn compression(err: CompressionError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Compression(inner))
    }

    /// Map an HTTP status to the kind a caller can act on.
    pub fn from_status(status: u16, url: impl Into<String>) -> Self {
        let url = url.into();
        match status {
            401 => Self::Unauthorized(url),
            403 => Self::PermissionDenied(url),
            404 | 410 => Self::NotFound(url),
            _ => Self::Http { status, url },
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.url().map(|u| u.to_string()).unwrap_or_default());
        }
        if err.is_connect() {
            return Self::Unavailable(err.to_string());
        }
        Self::Network(err.to_string())
    }

    /// Name of the kind without its payload, for problem reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Unavailable(_) => "Unavailable",
            Self::Http { .. } => "Http",
            Self::Network(_) => "Network",
            Self::Io(_) => "Io",
            Self::InvalidData(_) => "InvalidData",
            Self::Deserialize(_) => "Deserialize",
            Self::UnknownType(_) => "UnknownType",
            Self::UnsupportedMime(_) => "UnsupportedMime",
            Self::NestingTooDeep(_) => "NestingTooDeep",
            Self::Compression(_) => "Compression",
            Self::Timeout(_) => "Timeout",
            Self::StateType(_) => "StateType",
        }
    }

    /// Returns `true` if the object is known to be gone.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Retryable for ErrorKind {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Network(_) | Self::Unavailable(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Compression(kind) => kind.is_retryable(),
            _ => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(401, "Unauthorized")]
    #[case(403, "PermissionDenied")]
    #[case(404, "NotFound")]
    #[case(410, "NotFound")]
    #[case(500, "Http")]
    fn test_from_status(#[case] status: u16, #[case] expected: &str) {
        assert_eq!(ErrorKind::from_status(status, "https://example.invalid/").name(), expected);
    }

    #[rstest]
    #[case(ErrorKind::Network("reset".into()), true)]
    #[case(ErrorKind::Http { status: 503, url: String::new() }, true)]
    #[case(ErrorKind::Http { status: 429, url: String::new() }, true)]
    #[case(ErrorKind::Http { status: 400, url: String::new() }, false)]
    #[case(ErrorKind::NotFound("x".into()), false)]
    #[case(ErrorKind::Deserialize("x".into()), false)]
    fn test_is_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::NestingTooDeep(4).to_string(), "nesting limit of 4 exceeded");
        assert_eq!(
            ErrorKind::Http { status: 502, url: "https://example.invalid/".into() }.to_string(),
            "HTTP 502 from https://example.invalid/"
        );
    }
}
