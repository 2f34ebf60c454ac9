//! Handles: serializable references to single objects under a source.

use crate::manager::SourceManager;
use crate::resource::Resource;
use crate::source::{SourceKey, SourceRef, source_to_json};
use serde_json::{Map, Value};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

/// A reference to one object under a [`Source`](crate::Source).
///
/// Equality and hashing consider only the source (by value) and the relative
/// path; referrers and hints are ignored.
#[derive(Clone)]
pub struct Handle {
    pub source: SourceRef,
    pub relative_path: String,
    /// The handle through which this one was discovered, e.g. a linking page.
    pub referrer: Option<Box<Handle>>,
    /// Non-authoritative metadata collected during enumeration.
    hints: Option<Map<String, Value>>,
    /// Backend-specific serialized fields (a mail's subject, a drive item's
    /// display name).
    pub extra: Map<String, Value>,
}

impl Handle {
    pub fn new(source: SourceRef, relative_path: impl Into<String>) -> Self {
        Self { source, relative_path: relative_path.into(), referrer: None, hints: None, extra: Map::new() }
    }

    pub fn with_referrer(mut self, referrer: Option<Handle>) -> Self {
        self.referrer = referrer.map(Box::new);
        self
    }

    pub fn with_hints(mut self, hints: Option<Map<String, Value>>) -> Self {
        self.hints = hints.filter(|h| !h.is_empty());
        self
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.hints.get_or_insert_with(Map::new).insert(key.into(), value.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn hint(&self, key: &str) -> Option<&Value> {
        self.hints.as_ref()?.get(key)
    }

    pub fn hints(&self) -> Option<&Map<String, Value>> {
        self.hints.as_ref()
    }

    /// Hints go stale; clear them before reusing a reloaded handle.
    pub fn clear_hints(&mut self) -> &mut Self {
        self.hints = None;
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Everything after the last `/` of the path, or `file` if that's empty.
    pub fn name(&self) -> &str {
        match self.relative_path.trim_end_matches('/').rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => "file",
        }
    }

    /// Yields this handle, then the handle its source was derived from, and
    /// so on up to a top-level source.
    pub fn walk_up(&self) -> impl Iterator<Item = &Handle> {
        std::iter::successors(Some(self), |&h| h.source.handle())
    }

    /// The first handle in the referrer chain.
    pub fn base_referrer(&self) -> &Handle {
        let mut handle = self;
        while let Some(referrer) = handle.referrer.as_deref() {
            handle = referrer;
        }
        handle
    }

    pub fn guess_type(&self) -> String {
        self.source.guess_type(self)
    }

    pub fn presentation_name(&self) -> String {
        self.source.presentation_name(self)
    }

    pub fn presentation_place(&self) -> String {
        self.source.presentation_place(self)
    }

    pub fn presentation_url(&self) -> Option<String> {
        self.source.presentation_url(self)
    }

    pub fn sort_key(&self) -> String {
        self.source.sort_key(self)
    }

    pub fn follow<'a>(&self, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        self.source.follow(self, sm)
    }

    /// A copy of this handle whose source chain carries no credentials.
    pub fn censor(&self) -> Handle {
        Handle {
            source: self.source.censor(),
            relative_path: self.relative_path.clone(),
            referrer: self.referrer.as_ref().map(|r| Box::new(r.censor())),
            hints: self.hints.clone(),
            extra: self.extra.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.source.handle_type_label().into()));
        obj.insert("source".into(), source_to_json(self.source.as_ref()));
        obj.insert("path".into(), Value::String(self.relative_path.clone()));
        if let Some(referrer) = &self.referrer {
            obj.insert("referrer".into(), referrer.to_json());
        }
        obj.insert("hints".into(), self.hints.clone().map(Value::Object).unwrap_or(Value::Null));
        for (k, v) in &self.extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(obj)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path && *self.source == *other.source
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        SourceKey::of(self.source.as_ref()).hash(state);
        self.relative_path.hash(state);
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("type", &self.source.handle_type_label())
            .field("source", &self.source)
            .field("path", &self.relative_path)
            .finish_non_exhaustive()
    }
}

/// A handle displays as its presentation: its name and where it is.
impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (in {})", self.presentation_name(), self.presentation_place())
    }
}
