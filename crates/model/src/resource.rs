//! Resources: handles bound to live source state.
//!
//! A [`Resource`] is created by [`Handle::follow`] and borrows the
//! [`SourceManager`](crate::SourceManager) that holds its source's state.
//! Content is read through a synchronous [`BoxSyncRead`] so that decoders can
//! run on a blocking thread; everything that talks to a backend is async.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use async_trait::async_trait;
use exn::ResultExt;
use serde_json::{Map, Value};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use time::OffsetDateTime;

pub type BoxSyncRead = Box<dyn Read + Send + 'static>;

/// MIME types that say nothing about the content.
const GENERIC_TYPES: [&str; 2] = ["application/octet-stream", "text/plain"];
const SNIFF_BYTES: u64 = 8192;

/// A local path holding a resource's content, removed on drop if temporary.
#[derive(Debug)]
pub enum ResourcePath {
    Local(PathBuf),
    Temp(TempPath),
}

impl ResourcePath {
    pub fn as_path(&self) -> &Path {
        match self {
            ResourcePath::Local(p) => p,
            ResourcePath::Temp(p) => p,
        }
    }
}

#[async_trait]
pub trait Resource: Send + Sync {
    fn handle(&self) -> &Handle;

    /// Returns `false` if the object is gone from its backend.
    async fn check(&self) -> Result<bool> {
        match self.size().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self) -> Result<u64>;

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(None)
    }

    /// The MIME type of the content. Name-based guesses too generic to be
    /// useful are replaced by sniffing the first bytes.
    async fn compute_type(&self) -> Result<String> {
        let guess = self.handle().guess_type();
        if !GENERIC_TYPES.contains(&guess.as_str()) {
            return Ok(guess);
        }
        let head = read_head(self.stream().await?, SNIFF_BYTES).await?;
        Ok(sniff(&head).unwrap_or(guess))
    }

    async fn stream(&self) -> Result<BoxSyncRead>;

    /// A filesystem path holding the content. Resources without a native
    /// path spool their stream into a temporary file.
    async fn path(&self) -> Result<ResourcePath> {
        let reader = self.stream().await?;
        spool(reader).await.map(ResourcePath::Temp)
    }

    /// Backend-specific metadata for match reports.
    async fn metadata(&self) -> Result<Map<String, Value>> {
        Ok(Map::new())
    }
}

/// Best-effort content-based MIME detection.
pub fn sniff(head: &[u8]) -> Option<String> {
    if let Some(kind) = infer::get(head) {
        return Some(kind.mime_type().to_string());
    }
    // A multi-byte character cut off by the head limit is still text.
    let is_text = match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(err) => err.error_len().is_none(),
    };
    (!head.is_empty() && is_text).then(|| "text/plain".to_string())
}

pub fn cursor(bytes: impl Into<Vec<u8>>) -> BoxSyncRead {
    Box::new(Cursor::new(bytes.into()))
}

/// Reads at most `limit` bytes on a blocking thread.
pub async fn read_head(reader: BoxSyncRead, limit: u64) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buffer = Vec::new();
        reader.take(limit).read_to_end(&mut buffer).map(|_| buffer)
    })
    .await
    .or_raise(|| ErrorKind::InvalidData("reader task panicked".into()))?
    .map_err(|e| exn::Exn::from(ErrorKind::Io(e)))
}

pub async fn read_all(reader: BoxSyncRead) -> Result<Vec<u8>> {
    read_head(reader, u64::MAX).await
}

/// Copies a reader into a new temporary file.
pub async fn spool(mut reader: BoxSyncRead) -> Result<TempPath> {
    tokio::task::spawn_blocking(move || {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::copy(&mut reader, &mut file)?;
        Ok::<_, std::io::Error>(file.into_temp_path())
    })
    .await
    .or_raise(|| ErrorKind::InvalidData("spool task panicked".into()))?
    .map_err(|e| exn::Exn::from(ErrorKind::Io(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"%PDF-1.7\n".as_slice(), Some("application/pdf"))]
    #[case(b"\x1f\x8b\x08\x00".as_slice(), Some("application/gzip"))]
    #[case(b"plain words".as_slice(), Some("text/plain"))]
    #[case(b"".as_slice(), None)]
    #[case(b"\x80\x81\x82".as_slice(), None)]
    fn test_sniff(#[case] head: &[u8], #[case] expected: Option<&str>) {
        assert_eq!(sniff(head).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let head = read_head(cursor(b"0123456789".to_vec()), 4).await.unwrap();
        assert_eq!(head, b"0123");
    }

    #[tokio::test]
    async fn test_spool() {
        let path = spool(cursor(b"spooled".to_vec())).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"spooled");
        let kept = path.to_path_buf();
        drop(path);
        assert!(!kept.exists());
    }
}
