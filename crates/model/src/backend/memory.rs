//! In-memory sources for tests of the pipeline and transport crates.
//!
//! A [`MemorySource`] serializes its files inline, so scan specifications
//! built from one survive the trip through a broker. Marked `independent`,
//! each of its files is instead the JSON of another memory source and is
//! explored as a scan of its own, the way account-enumerating backends are.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::registry::{Registry, field, from_fields};
use crate::resource::{BoxSyncRead, Resource, cursor, read_all};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef, derived_eq_properties, derived_to_json};
use async_stream::stream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;

pub const LABEL: &str = "memory";
pub const NESTED_LABEL: &str = "memory-nested";
/// Content type of a file holding another memory source.
pub const MIME: &str = "application/vnd.trawl.memory+json";

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, MemorySource::decode);
    registry.register_source(NESTED_LABEL, NestedMemorySource::decode);
    registry.register_mime(MIME, |h| Arc::new(NestedMemorySource::new(h)));
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFile {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
    /// Overrides name-based type guessing.
    #[serde(default)]
    pub mime: Option<String>,
}

impl MemoryFile {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self { content: content.into(), ..Self::default() }
    }

    pub fn modified(mut self, at: OffsetDateTime) -> Self {
        self.modified = Some(at);
        self
    }

    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

/// Open state of both memory sources.
#[derive(Debug)]
struct MemoryFiles(BTreeMap<String, MemoryFile>);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySource {
    name: String,
    #[serde(default)]
    files: BTreeMap<String, MemoryFile>,
    #[serde(default)]
    independent: bool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_file(mut self, path: impl Into<String>, file: MemoryFile) -> Self {
        self.files.insert(path.into(), file);
        self
    }

    pub fn with_text(self, path: impl Into<String>, text: &str) -> Self {
        self.with_file(path, MemoryFile::new(text))
    }

    /// Adds `source` as a file to be explored as a scan of its own, and
    /// makes this source one that yields independent sources.
    pub fn with_nested(mut self, path: impl Into<String>, source: &MemorySource) -> Self {
        let content = serde_json::to_vec(source).unwrap_or_default();
        self.independent = true;
        self.with_file(path, MemoryFile::new(content).mime(MIME))
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(from_fields::<Self>(obj)?))
    }
}

fn file_handles<'a>(source: SourceRef, sm: &'a SourceManager) -> HandleStream<'a> {
    Box::pin(stream! {
        let files = match sm.open_as::<MemoryFiles>(source.as_ref()).await {
            Ok(files) => files,
            Err(e) => { yield Err(e); return; }
        };
        for path in files.0.keys() {
            yield Ok(Handle::new(source.clone(), path.clone()));
        }
    })
}

#[async_trait]
impl Source for MemorySource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"name": self.name})
    }

    fn yields_independent_sources(&self) -> bool {
        self.independent
    }

    fn censor(&self) -> SourceRef {
        Arc::new(self.clone())
    }

    fn to_json(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(obj)) => obj,
            _ => Map::new(),
        }
    }

    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        Ok(Opened::new(MemoryFiles(self.files.clone())))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        file_handles(self, sm)
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(MemoryResource { handle: handle.clone(), sm })
    }

    fn guess_type(&self, handle: &Handle) -> String {
        match self.files.get(&handle.relative_path).and_then(|f| f.mime.clone()) {
            Some(mime) => mime,
            None => crate::mime::guess_from_name(&handle.relative_path),
        }
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        format!("memory source {}", self.name)
    }
}

/// A memory source read from the content of a handle.
#[derive(Clone, Debug)]
pub struct NestedMemorySource {
    handle: Handle,
}

impl NestedMemorySource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }
}

#[async_trait]
impl Source for NestedMemorySource {
    fn type_label(&self) -> &'static str {
        NESTED_LABEL
    }

    fn eq_properties(&self) -> Value {
        derived_eq_properties(&self.handle)
    }

    fn handle(&self) -> Option<&Handle> {
        Some(&self.handle)
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self::new(self.handle.censor()))
    }

    fn to_json(&self) -> Map<String, Value> {
        derived_to_json(&self.handle)
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let content = read_all(self.handle.follow(sm).stream().await?).await?;
        let inner: MemorySource = serde_json::from_slice(&content)
            .map_err(|e| exn::Exn::from(ErrorKind::InvalidData(format!("not a memory source: {e}"))))?;
        Ok(Opened::new(MemoryFiles(inner.files)))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        file_handles(self, sm)
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(MemoryResource { handle: handle.clone(), sm })
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.handle.to_string()
    }
}

struct MemoryResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

impl MemoryResource<'_> {
    async fn file(&self) -> Result<MemoryFile> {
        let files = self.sm.open_as::<MemoryFiles>(self.handle.source.as_ref()).await?;
        files
            .0
            .get(&self.handle.relative_path)
            .cloned()
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(self.handle.relative_path.clone())))
    }
}

#[async_trait]
impl Resource for MemoryResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.file().await?.content.len() as u64)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self.file().await?.modified)
    }

    async fn compute_type(&self) -> Result<String> {
        let file = self.file().await?;
        match file.mime {
            Some(mime) => Ok(mime),
            None => Ok(crate::resource::sniff(&file.content).unwrap_or_else(|| self.handle.guess_type())),
        }
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(self.file().await?.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use time::macros::datetime;

    fn inner() -> MemorySource {
        MemorySource::new("inner").with_text("a.txt", "alpha")
    }

    #[tokio::test]
    async fn test_files() {
        let sm = SourceManager::default();
        let source = Arc::new(
            MemorySource::new("root")
                .with_text("b.txt", "bravo")
                .with_file("a.bin", MemoryFile::new(vec![0, 1, 2]).modified(datetime!(2024-01-01 0:00 UTC))),
        );
        let handles: Vec<Handle> = source.clone().handles(&sm, None).try_collect().await.unwrap();
        assert_eq!(handles.iter().map(|h| h.relative_path.as_str()).collect::<Vec<_>>(), ["a.bin", "b.txt"]);

        let resource = handles[0].follow(&sm);
        assert_eq!(resource.size().await.unwrap(), 3);
        assert_eq!(resource.last_modified().await.unwrap(), Some(datetime!(2024-01-01 0:00 UTC)));
        assert_eq!(read_all(handles[1].follow(&sm).stream().await.unwrap()).await.unwrap(), b"bravo");

        let gone = Handle::new(source, "c.txt");
        assert!(!gone.follow(&sm).check().await.unwrap());
    }

    #[test]
    fn test_round_trip() {
        let registry = Registry::default();
        let source = Arc::new(inner().with_file("x.bin", MemoryFile::new(vec![255, 0]).modified(datetime!(2024-01-01 0:00 UTC))));
        let handle = Handle::new(source, "x.bin");
        let decoded = registry.decode_handle(&handle.to_json()).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(decoded.to_json(), handle.to_json());
    }

    #[tokio::test]
    async fn test_nested_sources() {
        let sm = SourceManager::default();
        let registry = Registry::default();
        let outer = Arc::new(MemorySource::new("accounts").with_nested("inner", &inner()));
        assert!(outer.yields_independent_sources());

        let handles: Vec<Handle> = outer.handles(&sm, None).try_collect().await.unwrap();
        let nested = registry.from_handle(&handles[0], Some(&sm)).await.unwrap().unwrap();
        assert_eq!(nested.type_label(), NESTED_LABEL);
        let files: Vec<Handle> = nested.handles(&sm, None).try_collect().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(read_all(files[0].follow(&sm).stream().await.unwrap()).await.unwrap(), b"alpha");
    }
}
