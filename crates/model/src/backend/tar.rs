//! Tar archives.
//!
//! Opening a tar source indexes the archive once; members are then read
//! straight from their data offsets without walking the archive again.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::registry::{Registry, field};
use crate::resource::{BoxSyncRead, Resource, ResourcePath};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef, derived_eq_properties, derived_to_json};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use time::OffsetDateTime;

pub const LABEL: &str = "tar";

#[derive(Clone, Debug)]
pub struct TarSource {
    handle: Handle,
}

#[derive(Clone, Copy, Debug)]
struct Member {
    offset: u64,
    size: u64,
    mtime: u64,
}

#[derive(Debug)]
struct TarIndex {
    archive: ResourcePath,
    order: Vec<String>,
    members: HashMap<String, Member>,
}

impl TarIndex {
    fn build(archive: ResourcePath) -> std::io::Result<Self> {
        let mut order = Vec::new();
        let mut members = HashMap::new();
        let mut tar = tar::Archive::new(File::open(archive.as_path())?);
        for entry in tar.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let member = Member {
                offset: entry.raw_file_position(),
                size: entry.size(),
                mtime: entry.header().mtime().unwrap_or_default(),
            };
            if members.insert(name.clone(), member).is_none() {
                order.push(name);
            }
        }
        Ok(Self { archive, order, members })
    }

    fn member(&self, name: &str) -> Result<Member> {
        self.members.get(name).copied().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(name.to_string())))
    }
}

impl TarSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, TarSource::decode);
    registry.register_mime("application/x-tar", |h| Arc::new(TarSource::new(h)));
}

#[async_trait]
impl Source for TarSource {
    fn type_label(&self) -> &'static str {
        LABEL
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

    #[tracing::instrument(skip(self, sm), fields(handle = %self.handle))]
    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let archive = self.handle.follow(sm).path().await?;
        let index = tokio::task::spawn_blocking(move || TarIndex::build(archive))
            .await
            .or_raise(|| ErrorKind::InvalidData("tar index task panicked".into()))?
            .or_raise(|| ErrorKind::InvalidData("unreadable tar archive".into()))?;
        tracing::debug!(members = index.order.len(), "indexed tar archive");
        Ok(Opened::new(index))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        Box::pin(stream! {
            let index = match sm.open_as::<TarIndex>(self.as_ref()).await {
                Ok(index) => index,
                Err(e) => { yield Err(e); return; }
            };
            let source: SourceRef = self;
            for name in &index.order {
                yield Ok(Handle::new(source.clone(), name.clone()));
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(TarResource { handle: handle.clone(), sm })
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.handle.to_string()
    }
}

struct TarResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

impl TarResource<'_> {
    async fn lookup(&self) -> Result<(Arc<TarIndex>, Member)> {
        let index = self.sm.open_as::<TarIndex>(self.handle.source.as_ref()).await?;
        let member = index.member(&self.handle.relative_path)?;
        Ok((index, member))
    }
}

#[async_trait]
impl Resource for TarResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.lookup().await?.1.size)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        let mtime = self.lookup().await?.1.mtime;
        Ok(OffsetDateTime::from_unix_timestamp(mtime as i64).ok())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let (index, member) = self.lookup().await?;
        let mut file = File::open(index.archive.as_path()).map_err(ErrorKind::Io)?;
        file.seek(SeekFrom::Start(member.offset)).map_err(ErrorKind::Io)?;
        Ok(Box::new(file.take(member.size)))
    }
}
