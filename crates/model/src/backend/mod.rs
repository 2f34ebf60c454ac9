//! Built-in backends.
//!
//! Every backend module exposes a `register` function adding its type
//! labels (and, for derived sources, the MIME types it understands) to a
//! [`Registry`].

pub mod data;
pub mod ews;
pub mod file;
pub mod filtered;
pub mod google;
pub mod mail;
#[cfg(any(test, feature = "mock"))]
pub mod memory;
pub mod msgraph;
pub mod smbc;
pub mod tar;
pub mod web;
pub mod webdav;

use crate::registry::Registry;

pub(crate) fn register_all(registry: &mut Registry) {
    data::register(registry);
    ews::register(registry);
    file::register(registry);
    filtered::register(registry);
    google::register(registry);
    mail::register(registry);
    #[cfg(any(test, feature = "mock"))]
    memory::register(registry);
    msgraph::register(registry);
    smbc::register(registry);
    tar::register(registry);
    web::register(registry);
    webdav::register(registry);
}
