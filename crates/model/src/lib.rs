//! The object model shared by every pipeline stage.
//!
//! - A [`Source`] describes where a hierarchy of objects lives;
//! - a [`Handle`] names one object under a source and travels through the
//!   pipeline as JSON;
//! - a [`Resource`] binds a handle to live connection state held by a
//!   [`SourceManager`];
//! - a [`Registry`] turns JSON back into sources and handles, and turns
//!   handles whose content is itself a container (archives, compressed
//!   files, mails) into derived sources.

pub mod backend;
pub mod error;
mod handle;
mod http;
mod manager;
pub mod mime;
mod registry;
mod resource;
pub mod rule;
mod source;
#[cfg(test)]
pub(crate) mod testing;

pub use crate::handle::Handle;
pub use crate::http::HttpConfig;
pub use crate::manager::SourceManager;
pub use crate::registry::{MimeFactory, Registry, SourceDecoder};
pub use crate::resource::{BoxSyncRead, Resource, ResourcePath, read_all, read_head};
pub use crate::rule::{OutputType, Rule, SimpleRule};
pub use crate::source::{HandleStream, Opened, Source, SourceKey, SourceRef, State, source_to_json};
