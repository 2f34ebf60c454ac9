//! Local filesystem source.
//!
//! Objects are files below an absolute root directory. The same walker and
//! resource serve every source whose state is a [`LocalRoot`], such as an SMB
//! share mounted into the local filesystem.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::registry::{Registry, str_field};
use crate::resource::{BoxSyncRead, Resource, ResourcePath};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry};
use tokio::sync::OnceCell;

pub const LABEL: &str = "file";

/// Open state of a source whose objects are local files.
#[derive(Debug, Clone)]
pub struct LocalRoot(pub PathBuf);

#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// # Errors
    ///
    /// Returns an error if the path is not absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            exn::bail!(ErrorKind::Deserialize(format!("path `{}` is not absolute", path.display())));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A handle for a local file, rooted at its parent directory.
    pub fn make_handle(path: impl AsRef<Path>) -> Result<Handle> {
        let path = path.as_ref();
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            exn::bail!(ErrorKind::Deserialize(format!("`{}` has no file name", path.display())));
        };
        let source: SourceRef = Arc::new(Self::new(parent)?);
        Ok(Handle::new(source, name.to_string_lossy()))
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(str_field(obj, "path")?)?))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, FileSource::decode);
}

#[async_trait]
impl Source for FileSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"path": self.path})
    }

    fn censor(&self) -> SourceRef {
        Arc::new(self.clone())
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("path".into(), self.path.to_string_lossy().into());
        obj
    }

    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        Ok(Opened::new(LocalRoot(self.path.clone())))
    }

    fn handles<'a>(self: Arc<Self>, _sm: &'a SourceManager, rule: Option<&'a Rule>) -> HandleStream<'a> {
        let root = self.path.clone();
        let walker = Walker { root, cutoff: rule.and_then(Rule::last_modified_cutoff), skip: |_| false };
        walker.walk(self)
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(LocalResource::new(handle.clone(), sm))
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        let full = self.path.join(&handle.relative_path);
        full.parent().unwrap_or(&self.path).to_string_lossy().into_owned()
    }

    fn sort_key(&self, handle: &Handle) -> String {
        self.path.join(&handle.relative_path).to_string_lossy().into_owned()
    }
}

enum WalkEntry {
    File(String),
    Descend(PathBuf),
    Skip,
}

/// Depth-first walk of a local directory tree.
pub(crate) struct Walker {
    pub root: PathBuf,
    /// Files last modified before this are not yielded.
    pub cutoff: Option<OffsetDateTime>,
    /// Names (files or directories) to leave out entirely.
    pub skip: fn(&str) -> bool,
}

impl Walker {
    pub(crate) fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.display().to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let name = entry.file_name();
        if (self.skip)(&name.to_string_lossy()) {
            return Ok(WalkEntry::Skip);
        }
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if !metadata.is_file() {
            // Sockets, devices and broken symlinks.
            return Ok(WalkEntry::Skip);
        }
        if let Some(cutoff) = self.cutoff
            && modified(&metadata).is_some_and(|m| m < cutoff)
        {
            return Ok(WalkEntry::Skip);
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(&path);
        let relative = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        Ok(WalkEntry::File(relative))
    }

    pub(crate) fn walk<'a>(self, source: SourceRef) -> HandleStream<'a> {
        let mut stack = vec![self.root.clone()];
        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Unreadable subdirectories are skipped, not fatal.
                    Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied && current != self.root => {
                        tracing::debug!(path = %current.display(), "skipping unreadable directory");
                        continue 'dirs;
                    }
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(relative)) => yield Ok(Handle::new(source.clone(), relative)),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }
}

fn modified(metadata: &Metadata) -> Option<OffsetDateTime> {
    metadata.modified().ok().map(OffsetDateTime::from)
}

/// A file below a [`LocalRoot`].
pub(crate) struct LocalResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
    stat: OnceCell<Metadata>,
}

impl<'a> LocalResource<'a> {
    pub(crate) fn new(handle: Handle, sm: &'a SourceManager) -> Self {
        Self { handle, sm, stat: OnceCell::new() }
    }

    async fn full_path(&self) -> Result<PathBuf> {
        let root = self.sm.open_as::<LocalRoot>(self.handle.source.as_ref()).await?;
        Ok(root.0.join(&self.handle.relative_path))
    }

    async fn stat(&self) -> Result<&Metadata> {
        self.stat
            .get_or_try_init(|| async {
                let path = self.full_path().await?;
                fs::metadata(&path).await.map_err(|e| exn::Exn::from(Walker::map_io_error(e, &path)))
            })
            .await
    }
}

#[async_trait]
impl Resource for LocalResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let path = self.full_path().await?;
        fs::try_exists(&path).await.map_err(|e| exn::Exn::from(Walker::map_io_error(e, &path)))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.stat().await?.len())
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(modified(self.stat().await?))
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let path = self.full_path().await?;
        let file = fs::File::open(&path).await.map_err(|e| Walker::map_io_error(e, &path))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn path(&self) -> Result<ResourcePath> {
        Ok(ResourcePath::Local(self.full_path().await?))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            metadata.insert("filesystem-owner-uid".into(), self.stat().await?.uid().into());
        }
        if let Some(modified) = self.last_modified().await? {
            metadata.insert("last-modified".into(), crate::http::format_rfc3339(modified).into());
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::time::{Duration, SystemTime};

    fn touch(path: &Path, data: &[u8], mtime: SystemTime) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
        std::fs::File::options().write(true).open(path).unwrap().set_modified(mtime).unwrap();
    }

    #[test]
    fn test_new_requires_absolute_path() {
        assert!(FileSource::new("relative/path").is_err());
        assert!(FileSource::new("/absolute").is_ok());
    }

    #[tokio::test]
    async fn test_handles_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        touch(&dir.path().join("a.txt"), b"a", now);
        touch(&dir.path().join("sub/deeper/b.txt"), b"b", now);
        let source = Arc::new(FileSource::new(dir.path()).unwrap());
        let sm = SourceManager::default();
        let mut paths: Vec<_> =
            source.handles(&sm, None).map_ok(|h| h.relative_path).try_collect::<Vec<_>>().await.unwrap();
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "sub/deeper/b.txt"]);
    }

    #[tokio::test]
    async fn test_last_modified_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let day = Duration::from_secs(86_400);
        touch(&dir.path().join("old.txt"), b"1", now - day * 2);
        touch(&dir.path().join("older.txt"), b"2", now - day);
        touch(&dir.path().join("new.txt"), b"3", now + day);
        let rule = Rule::last_modified(OffsetDateTime::from(now));
        let source = Arc::new(FileSource::new(dir.path()).unwrap());
        let sm = SourceManager::default();
        let handles: Vec<_> = source.handles(&sm, Some(&rule)).try_collect().await.unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].relative_path, "new.txt");
    }

    #[tokio::test]
    async fn test_resource() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("doc.txt"), b"hello", SystemTime::now());
        let handle = FileSource::make_handle(dir.path().join("doc.txt")).unwrap();
        let sm = SourceManager::default();
        let resource = handle.follow(&sm);
        assert!(resource.check().await.unwrap());
        assert_eq!(resource.size().await.unwrap(), 5);
        assert_eq!(resource.compute_type().await.unwrap(), "text/plain");
        assert!(resource.last_modified().await.unwrap().is_some());
        let data = crate::read_all(resource.stream().await.unwrap()).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(handle.presentation_place(), dir.path().to_string_lossy());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let handle = FileSource::make_handle(dir.path().join("gone.txt")).unwrap();
        let sm = SourceManager::default();
        let resource = handle.follow(&sm);
        assert!(!resource.check().await.unwrap());
        let err = resource.size().await.unwrap_err();
        assert!(err.is_missing());
    }
}
