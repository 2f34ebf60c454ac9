//! Sources holding their content inline, usually built from `data:` URLs.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::mime::OCTET_STREAM;
use crate::registry::{Registry, opt_str};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub const LABEL: &str = "data";

#[derive(Clone, Debug)]
pub struct DataSource {
    content: Option<Arc<Vec<u8>>>,
    mime: String,
    name: Option<String>,
}

impl DataSource {
    pub fn new(content: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        Self { content: Some(Arc::new(content.into())), mime: mime.into(), name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parses an RFC 2397 URL of the form `data:[<mime>][;base64],<content>`.
    pub fn from_url(url: &str) -> Result<Self> {
        let (mime, content) = unpack_data_url(url)?;
        Ok(Self::new(content, mime))
    }

    pub fn to_url(&self) -> String {
        let content = self.content.as_deref().map(|c| STANDARD.encode(c)).unwrap_or_default();
        format!("data:{};base64,{content}", self.mime)
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        let content = match obj.get("content").and_then(Value::as_str) {
            Some(encoded) => Some(Arc::new(
                STANDARD.decode(encoded).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))?,
            )),
            None => None,
        };
        Ok(Arc::new(Self {
            content,
            mime: opt_str(obj, "mime").unwrap_or_else(|| OCTET_STREAM.to_string()),
            name: opt_str(obj, "name"),
        }))
    }

    fn content(&self) -> Result<Arc<Vec<u8>>> {
        self.content.clone().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound("censored data source".into())))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, DataSource::decode);
}

#[async_trait]
impl Source for DataSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({
            "content": self.content.as_deref().map(|c| STANDARD.encode(c)),
            "mime": self.mime,
            "name": self.name,
        })
    }

    /// Inline content can be sensitive in itself.
    fn censor(&self) -> SourceRef {
        Arc::new(Self { content: None, ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("content".into(), self.content.as_deref().map(|c| STANDARD.encode(c)).into());
        obj.insert("mime".into(), self.mime.clone().into());
        obj.insert("name".into(), self.name.clone().into());
        obj
    }

    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        Ok(Opened::new(()))
    }

    fn handles<'a>(self: Arc<Self>, _sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        let result = if self.content.is_some() {
            let path = self.name.clone().unwrap_or_else(|| "file".into());
            Ok(Handle::new(self, path))
        } else {
            Err(exn::Exn::from(ErrorKind::InvalidData("can't explore a data source with no content".into())))
        };
        Box::pin(futures::stream::once(async move { result }))
    }

    fn follow<'a>(&self, handle: &Handle, _sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(DataResource { handle: handle.clone(), source: self.clone() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        self.mime.clone()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("embedded file of type {}", self.guess_type(handle)),
        }
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        "embedded".to_string()
    }
}

struct DataResource {
    handle: Handle,
    source: DataSource,
}

#[async_trait]
impl Resource for DataResource {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.source.content()?.len() as u64)
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(self.source.mime.clone())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(self.source.content()?.as_slice()))
    }
}

/// Splits a `data:` URL into its MIME type and decoded content. A missing
/// MIME type means `text/plain`.
pub fn unpack_data_url(url: &str) -> Result<(String, Vec<u8>)> {
    let Some(rest) = url.strip_prefix("data:") else {
        exn::bail!(ErrorKind::Deserialize(format!("`{url}` is not a data URL")));
    };
    let Some((lead, content)) = rest.split_once(',') else {
        exn::bail!(ErrorKind::Deserialize("data URL has no content separator".into()));
    };
    let (lead, is_base64) = match lead.strip_suffix(";base64") {
        Some(lead) => (lead, true),
        None => (lead, false),
    };
    let mime = if lead.is_empty() { "text/plain".to_string() } else { lead.to_string() };
    let content = percent_decode(content);
    let content = if is_base64 {
        STANDARD.decode(&content).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))?
    } else {
        content
    };
    Ok((mime, content))
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(byte) = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
