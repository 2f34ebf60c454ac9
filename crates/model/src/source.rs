//! The [`Source`] trait: the root of an explorable hierarchy of objects.
//!
//! A source is a plain value describing where objects live and how to reach
//! them. Live connection state is never stored in the source itself; it is
//! produced by [`Source::open`] and cached by a
//! [`SourceManager`](crate::SourceManager), keyed by the source's
//! [`eq_properties`](Source::eq_properties).

use crate::error::Result;
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::resource::Resource;
use crate::rule::Rule;
use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;

pub type SourceRef = Arc<dyn Source>;
pub type HandleStream<'a> = Pin<Box<dyn Stream<Item = Result<Handle>> + Send + 'a>>;
/// Open state shared between the source manager and live resources.
pub type State = Arc<dyn Any + Send + Sync>;

/// The result of opening a source: its state and an optional teardown.
pub struct Opened {
    pub(crate) state: State,
    pub(crate) close: Option<Box<dyn FnOnce() + Send>>,
}

impl Opened {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self { state: Arc::new(state), close: None }
    }

    /// Run `close` exactly once when the source manager lets go of this
    /// state.
    pub fn with_close(mut self, close: impl FnOnce() + Send + 'static) -> Self {
        self.close = Some(Box::new(close));
        self
    }
}

impl Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opened").field("close", &self.close.is_some()).finish_non_exhaustive()
    }
}

/// Uniform interface for every scannable backend.
///
/// Implementations are cheap value types. Anything expensive (a login, a
/// mount, a decompressed temporary file) belongs in [`Source::open`].
#[async_trait]
pub trait Source: Send + Sync + Debug + 'static {
    /// Serialization discriminant.
    fn type_label(&self) -> &'static str;

    /// Type label of the handles this source yields.
    fn handle_type_label(&self) -> &'static str {
        self.type_label()
    }

    /// The attributes that decide value equality. Cosmetic fields and
    /// secrets that don't change what the source points at are left out.
    fn eq_properties(&self) -> Value;

    /// The handle this source was derived from, if any.
    fn handle(&self) -> Option<&Handle> {
        None
    }

    /// Marks sources whose handles are independent scan roots rather than
    /// scannable objects.
    fn yields_independent_sources(&self) -> bool {
        false
    }

    /// Whether `handle` was reached, directly or through derived sources,
    /// from this source.
    fn contains(&self, handle: &Handle) -> bool {
        let (label, props) = (self.type_label(), self.eq_properties());
        handle.walk_up().any(|h| h.source.type_label() == label && h.source.eq_properties() == props)
    }

    /// A copy of this source with credentials removed.
    fn censor(&self) -> SourceRef;

    /// Serializable fields of this source, without the `type` key.
    fn to_json(&self) -> Map<String, Value>;

    /// Builds the connection state for this source.
    async fn open(&self, sm: &SourceManager) -> Result<Opened>;

    /// Lazily enumerates the objects under this source. A rule may be given
    /// so that backends can push filters (such as a last-modified cutoff)
    /// down into their queries.
    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, rule: Option<&'a Rule>) -> HandleStream<'a>;

    /// Binds a handle of this source to live state.
    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a>;

    /// Guess an object's MIME type without touching the backend.
    fn guess_type(&self, handle: &Handle) -> String {
        crate::mime::guess_from_name(&handle.relative_path)
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        handle.name().to_string()
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.type_label().to_string()
    }

    fn presentation_url(&self, _handle: &Handle) -> Option<String> {
        None
    }

    fn sort_key(&self, handle: &Handle) -> String {
        handle.relative_path.clone()
    }
}

/// The identity of a source: its type plus its equality properties.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub label: &'static str,
    pub props: String,
}

impl SourceKey {
    pub fn of(source: &dyn Source) -> Self {
        Self { label: source.type_label(), props: source.eq_properties().to_string() }
    }
}

impl PartialEq for dyn Source {
    fn eq(&self, other: &Self) -> bool {
        SourceKey::of(self) == SourceKey::of(other)
    }
}

impl Eq for dyn Source {}

impl Hash for dyn Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        SourceKey::of(self).hash(state)
    }
}

/// Full JSON object for a source, including its `type` key.
pub fn source_to_json(source: &dyn Source) -> Value {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::String(source.type_label().into()));
    obj.extend(source.to_json());
    Value::Object(obj)
}

/// The `to_json` body shared by every source derived from a handle.
pub fn derived_to_json(handle: &Handle) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("handle".into(), handle.to_json());
    obj
}

/// The `eq_properties` shared by every source derived from a handle.
pub fn derived_eq_properties(handle: &Handle) -> Value {
    let parent = SourceKey::of(handle.source.as_ref());
    serde_json::json!([parent.label, parent.props, handle.relative_path])
}
