//! The scanning pipeline.
//!
//! Each stage turns one message into a stream of messages bound for named
//! queues. A scan enters as a [`ScanSpec`](messages::ScanSpec); the
//! [`explorer`] enumerates its objects, the [`processor`] converts each one,
//! the [`matcher`] evaluates the scan's rule and the [`tagger`] fetches the
//! metadata of matching objects. The [`worker`] chains processor, matcher
//! and tagger in one process. Stages never fail: errors become problem
//! messages.

pub mod conversions;
pub mod error;
pub mod explorer;
pub mod matcher;
pub mod matching;
pub mod messages;
pub mod processor;
mod stage;
pub mod tagger;
pub mod worker;

pub use crate::messages::{Emit, Message};
pub use crate::stage::{Pipeline, PipelineSettings, Stage};
