//! Pipeline Error Types
//!
//! Stage handlers never fail as a whole: every error raised while handling
//! one message is turned into a problem message at the stage boundary. These
//! kinds exist so that the conversion and decoding code underneath can use
//! `?` and still tell the stage what went wrong.

use derive_more::{Display, Error};
use std::time::Duration;
use trawl_model::OutputType;
use trawl_model::error::{Error as ModelError, ErrorKind as ModelErrorKind};
use trawl_retry::Retryable;

/// A pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A message body could not be decoded
    #[display("malformed message: {_0}")]
    Malformed(#[error(not(source))] String),
    /// A source or handle inside a message has an unregistered type label
    #[display("unknown scheme '{_0}'")]
    UnknownScheme(#[error(not(source))] String),
    /// The model layer failed; the frame below carries the details
    #[display("{_0}")]
    Model(#[error(not(source))] String),
    /// Model failure that is worth trying again
    #[display("{_0}")]
    Transient(#[error(not(source))] String),
    /// No converter produces `output` from `mime`
    #[display("no conversion from {mime} to {output}")]
    NoConverter { output: OutputType, mime: String },
    /// A converter couldn't make sense of the content
    #[display("conversion to {_0} failed")]
    Conversion(#[error(not(source))] OutputType),
    /// A rule couldn't be evaluated
    #[display("invalid rule: {_0}")]
    Rule(#[error(not(source))] String),
    #[display("timed out after {_0:?}")]
    Timeout(#[error(not(source))] Duration),
}

impl ErrorKind {
    /// Lift a model error into the pipeline, keeping it as a child frame.
    #[track_caller]
    pub fn model(err: ModelError) -> Error {
        let kind = match &*err {
            ModelErrorKind::UnknownType(label) => ErrorKind::UnknownScheme(label.clone()),
            ModelErrorKind::Timeout(after) => ErrorKind::Timeout(*after),
            kind if kind.is_retryable() => ErrorKind::Transient(kind.to_string()),
            kind => ErrorKind::Model(kind.to_string()),
        };
        err.raise(kind)
    }

    /// Short name used as the prefix of problem texts.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "Malformed",
            Self::UnknownScheme(_) => "UnknownScheme",
            Self::Model(_) | Self::Transient(_) => "ModelError",
            Self::NoConverter { .. } => "NoConverter",
            Self::Conversion(_) => "ConversionError",
            Self::Rule(_) => "RuleError",
            Self::Timeout(_) => "Timeout",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl Retryable for ErrorKind {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lift() {
        let err = ErrorKind::model(exn::Exn::from(ModelErrorKind::UnknownType("gopher".into())));
        assert!(matches!(&*err, ErrorKind::UnknownScheme(label) if label == "gopher"));

        let err = ErrorKind::model(exn::Exn::from(ModelErrorKind::Network("reset".into())));
        assert!(err.is_retryable());

        let err = ErrorKind::model(exn::Exn::from(ModelErrorKind::NotFound("x".into())));
        assert_eq!((*err).to_string(), "not found: x");
        assert!(!err.is_retryable());
    }
}
