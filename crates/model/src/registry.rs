//! Type-label and MIME dispatch tables.
//!
//! A [`Registry`] is built once at process start and passed by reference to
//! everything that decodes sources and handles or derives sources from
//! handles.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::mime::base_type;
use crate::source::SourceRef;
use exn::OptionExt;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub type SourceDecoder = fn(&Map<String, Value>, &Registry) -> Result<SourceRef>;
pub type MimeFactory = fn(Handle) -> SourceRef;

pub const DEFAULT_MAX_DEPTH: usize = 16;

pub struct Registry {
    sources: HashMap<&'static str, SourceDecoder>,
    mime: HashMap<&'static str, MimeFactory>,
    max_depth: usize,
}

impl Default for Registry {
    /// A registry that knows every built-in backend.
    fn default() -> Self {
        let mut registry = Registry::empty();
        crate::backend::register_all(&mut registry);
        registry
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut labels: Vec<_> = self.sources.keys().collect();
        labels.sort();
        f.debug_struct("Registry").field("sources", &labels).field("max_depth", &self.max_depth).finish()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self { sources: HashMap::new(), mime: HashMap::new(), max_depth: DEFAULT_MAX_DEPTH }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Registers the decoder for a source type label. A later registration
    /// for the same label replaces the earlier one.
    pub fn register_source(&mut self, label: &'static str, decoder: SourceDecoder) -> &mut Self {
        if self.sources.insert(label, decoder).is_some() {
            tracing::warn!(label, "replacing source decoder");
        }
        self
    }

    /// Registers the derived-source constructor for a MIME type.
    pub fn register_mime(&mut self, mime: &'static str, factory: MimeFactory) -> &mut Self {
        if self.mime.insert(mime, factory).is_some() {
            tracing::warn!(mime, "replacing MIME handler");
        }
        self
    }

    pub fn handles_mime(&self, mime: &str) -> bool {
        self.mime.contains_key(base_type(mime).as_str())
    }

    pub fn decode_source(&self, value: &Value) -> Result<SourceRef> {
        let obj = as_object(value)?;
        let label = str_field(obj, "type")?;
        let decode = self.sources.get(label).ok_or_raise(|| ErrorKind::UnknownType(label.to_string()))?;
        decode(obj, self)
    }

    pub fn decode_handle(&self, value: &Value) -> Result<Handle> {
        let obj = as_object(value)?;
        let label = str_field(obj, "type")?;
        let source = self.decode_source(field(obj, "source")?)?;
        if source.handle_type_label() != label {
            exn::bail!(ErrorKind::Deserialize(format!(
                "handle type `{label}` does not belong to a `{}` source",
                source.type_label()
            )));
        }
        let referrer = match obj.get("referrer") {
            None | Some(Value::Null) => None,
            Some(r) => Some(self.decode_handle(r)?),
        };
        let hints = match obj.get("hints") {
            Some(Value::Object(hints)) => Some(hints.clone()),
            _ => None,
        };
        let mut handle =
            Handle::new(source, str_field(obj, "path")?).with_referrer(referrer).with_hints(hints);
        for (k, v) in obj {
            if !matches!(k.as_str(), "type" | "source" | "path" | "referrer" | "hints") {
                handle.extra.insert(k.clone(), v.clone());
            }
        }
        Ok(handle)
    }

    /// Reinterprets the object behind `handle` as the root of a nested
    /// source, if a source is registered for its MIME type.
    ///
    /// With a source manager the type is computed from the content;
    /// without one it is guessed from the name.
    pub async fn from_handle(&self, handle: &Handle, sm: Option<&SourceManager>) -> Result<Option<SourceRef>> {
        let depth = handle.walk_up().count();
        if depth > self.max_depth {
            tracing::warn!(%handle, depth, "too much nesting, not exploring any deeper");
            exn::bail!(ErrorKind::NestingTooDeep(self.max_depth));
        }
        let mime = match sm {
            Some(sm) => handle.follow(sm).compute_type().await?,
            None => handle.guess_type(),
        };
        Ok(self.source_for_mime(handle, &mime))
    }

    /// The derived source for `handle`, given an already known MIME type.
    pub fn source_for_mime(&self, handle: &Handle, mime: &str) -> Option<SourceRef> {
        self.mime.get(base_type(mime).as_str()).map(|factory| factory(handle.clone()))
    }
}

pub fn as_object(value: &Value) -> Result<&Map<String, Value>> {
    value.as_object().ok_or_raise(|| ErrorKind::Deserialize(format!("expected an object, got `{value}`")))
}

pub fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    obj.get(key).ok_or_raise(|| ErrorKind::Deserialize(format!("missing key `{key}`")))
}

pub fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    field(obj, key)?.as_str().ok_or_raise(|| ErrorKind::Deserialize(format!("key `{key}` is not a string")))
}

pub fn opt_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

pub fn opt_bool(obj: &Map<String, Value>, key: &str, default: bool) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Deserializes a source's fields straight into a serde type.
pub fn from_fields<T: serde::de::DeserializeOwned>(obj: &Map<String, Value>) -> Result<T> {
    let mut fields = obj.clone();
    fields.remove("type");
    serde_json::from_value(Value::Object(fields)).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_type() {
        let err = Registry::default().decode_source(&json!({"type": "gopher"})).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownType(label) if label == "gopher"));
    }

    #[test]
    fn test_missing_key() {
        let err = Registry::default().decode_handle(&json!({"type": "file", "path": "x"})).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Deserialize(_)));
    }

    #[test]
    fn test_handle_round_trip() {
        let registry = Registry::default();
        let value = json!({
            "type": "file",
            "source": {"type": "file", "path": "/srv/share"},
            "path": "docs/a.txt",
            "referrer": {
                "type": "web",
                "source": {"type": "web", "url": "https://example.invalid"},
                "path": "index.html",
                "hints": null
            },
            "hints": {"last_modified": "2024-01-01T00:00:00Z"}
        });
        let handle = registry.decode_handle(&value).unwrap();
        assert_eq!(handle.name(), "a.txt");
        assert!(handle.hint("last_modified").is_some());
        let again = registry.decode_handle(&handle.to_json()).unwrap();
        assert_eq!(again, handle);
        assert_eq!(again.referrer.as_deref(), handle.referrer.as_deref());
        assert_eq!(again.to_json(), handle.to_json());
    }

    #[test]
    fn test_derived_round_trip() {
        let registry = Registry::default();
        let outer = registry
            .decode_handle(&json!({
                "type": "file",
                "source": {"type": "file", "path": "/srv"},
                "path": "bundle.tar.gz",
                "hints": null
            }))
            .unwrap();
        let gz = registry.source_for_mime(&outer, "application/gzip").unwrap();
        let inner = Handle::new(gz, "bundle.tar");
        assert_eq!(inner.walk_up().next(), Some(&inner));
        assert_eq!(inner.walk_up().count(), 2);
        let decoded = registry.decode_handle(&inner.to_json()).unwrap();
        assert_eq!(decoded, inner);
        assert_eq!(decoded.walk_up().nth(1), Some(&outer));
    }

    #[tokio::test]
    async fn test_from_handle_nesting_limit() {
        let registry = Registry::default().with_max_depth(2);
        let mut handle = registry
            .decode_handle(&json!({
                "type": "file",
                "source": {"type": "file", "path": "/srv"},
                "path": "x.gz",
                "hints": null
            }))
            .unwrap();
        for _ in 0..2 {
            let source = registry.from_handle(&handle, None).await.unwrap().unwrap();
            handle = Handle::new(source, "x.gz");
        }
        let err = registry.from_handle(&handle, None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NestingTooDeep(2)));
    }
}
