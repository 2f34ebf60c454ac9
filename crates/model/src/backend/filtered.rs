//! Single-stream compressed files (gzip, bzip2, xz) seen as a source of
//! exactly one decompressed object.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::registry::{Registry, field, str_field};
use crate::resource::{BoxSyncRead, Resource, ResourcePath};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef, derived_eq_properties, derived_to_json};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;
use time::OffsetDateTime;
use trawl_compress::Compression;

pub const HANDLE_LABEL: &str = "filtered";

#[derive(Clone, Debug)]
pub struct FilteredSource {
    compression: Compression,
    handle: Handle,
}

/// The decompressed content, spooled to a temporary file.
#[derive(Debug)]
struct Decompressed {
    path: TempPath,
    size: u64,
}

impl FilteredSource {
    pub fn new(handle: Handle, compression: Compression) -> Self {
        Self { compression, handle }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        let label = str_field(obj, "type")?;
        let compression =
            Compression::from_source_type_label(label).ok_or_raise(|| ErrorKind::UnknownType(label.to_string()))?;
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?, compression)))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    for compression in Compression::ALL {
        registry.register_source(compression.source_type_label(), FilteredSource::decode);
    }
    registry.register_mime("application/gzip", |h| Arc::new(FilteredSource::new(h, Compression::Gzip)));
    registry.register_mime("application/x-gzip", |h| Arc::new(FilteredSource::new(h, Compression::Gzip)));
    registry.register_mime("application/x-bzip2", |h| Arc::new(FilteredSource::new(h, Compression::Bzip2)));
    registry.register_mime("application/bzip2", |h| Arc::new(FilteredSource::new(h, Compression::Bzip2)));
    registry.register_mime("application/x-xz", |h| Arc::new(FilteredSource::new(h, Compression::Xz)));
    registry.register_mime("application/xz", |h| Arc::new(FilteredSource::new(h, Compression::Xz)));
}

#[async_trait]
impl Source for FilteredSource {
    fn type_label(&self) -> &'static str {
        self.compression.source_type_label()
    }

    fn handle_type_label(&self) -> &'static str {
        HANDLE_LABEL
    }

    fn eq_properties(&self) -> Value {
        derived_eq_properties(&self.handle)
    }

    fn handle(&self) -> Option<&Handle> {
        Some(&self.handle)
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self::new(self.handle.censor(), self.compression))
    }

    fn to_json(&self) -> Map<String, Value> {
        derived_to_json(&self.handle)
    }

    #[tracing::instrument(skip(self, sm), fields(handle = %self.handle))]
    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let compressed = self.handle.follow(sm).stream().await?;
        let compression = self.compression;
        let (path, size) = tokio::task::spawn_blocking(move || {
            let file = tempfile::NamedTempFile::new().map_err(ErrorKind::Io)?;
            let size = compression.decompress_to(compressed, file.as_file()).map_err(ErrorKind::compression)?;
            Ok::<_, crate::error::Error>((file.into_temp_path(), size))
        })
        .await
        .or_raise(|| ErrorKind::InvalidData("decompression task panicked".into()))??;
        tracing::debug!(size, "decompressed");
        Ok(Opened::new(Decompressed { path, size }))
    }

    fn handles<'a>(self: Arc<Self>, _sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        let name = self.handle.name();
        let stem = Path::new(name).file_stem().map(|s| s.to_string_lossy().into_owned());
        let path = stem.filter(|s| !s.is_empty()).unwrap_or_else(|| name.to_string());
        let handle = Handle::new(self, path);
        Box::pin(futures::stream::once(async move { Ok(handle) }))
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(FilteredResource { handle: handle.clone(), parent: self.handle.clone(), sm })
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.handle.to_string()
    }

    fn sort_key(&self, _handle: &Handle) -> String {
        self.handle.sort_key()
    }
}

struct FilteredResource<'a> {
    handle: Handle,
    parent: Handle,
    sm: &'a SourceManager,
}

impl FilteredResource<'_> {
    async fn decompressed(&self) -> Result<Arc<Decompressed>> {
        self.sm.open_as::<Decompressed>(self.handle.source.as_ref()).await
    }
}

#[async_trait]
impl Resource for FilteredResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        self.parent.follow(self.sm).check().await
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.decompressed().await?.size)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        self.parent.follow(self.sm).last_modified().await
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let state = self.decompressed().await?;
        let file = std::fs::File::open(&state.path).map_err(ErrorKind::Io)?;
        Ok(Box::new(file))
    }

    /// The temporary file lives as long as the source's open state, so the
    /// caller gets its own copy.
    async fn path(&self) -> Result<ResourcePath> {
        let reader = self.stream().await?;
        crate::resource::spool(reader).await.map(ResourcePath::Temp)
    }
}
