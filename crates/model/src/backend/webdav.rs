//! WebDAV servers, listed with `PROPFIND` one directory at a time.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::http::{check_status, parse_http_date, send_throttled};
use crate::manager::SourceManager;
use crate::registry::{Registry, opt_str, str_field};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use url::Url;

pub const LABEL: &str = "webdav";

const CONTENT_LENGTH: &str = "{DAV:}getcontentlength";
const LAST_MODIFIED: &str = "{DAV:}getlastmodified";
const DISPLAY_NAME: &str = "{DAV:}displayname";

#[derive(Clone, Debug)]
pub struct WebDavSource {
    base_url: String,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug)]
struct DavState {
    client: reqwest::Client,
    base: Url,
    user: Option<String>,
    password: Option<String>,
}

/// One `<response>` of a multistatus reply.
#[derive(Debug, PartialEq)]
struct DavEntry {
    path: String,
    is_folder: bool,
    props: Map<String, Value>,
}

impl WebDavSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), user: None, password: None }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self {
            base_url: str_field(obj, "base_url")?.to_string(),
            user: opt_str(obj, "user"),
            password: opt_str(obj, "password"),
        }))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, WebDavSource::decode);
}

impl DavState {
    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(&format!("/{}", path.trim_start_matches('/'))).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    /// Lists a directory, including the directory's own entry.
    async fn ls(&self, path: &str) -> Result<Vec<DavEntry>> {
        let propfind = reqwest::Method::from_bytes(b"PROPFIND")
            .map_err(|e| exn::Exn::from(ErrorKind::InvalidData(e.to_string())))?;
        let url = self.url(path)?;
        let response = send_throttled(|| self.request(propfind.clone(), url.clone()).header("Depth", "1")).await?;
        let response = check_status(response)?;
        if response.status().as_u16() != 207 {
            return Ok(Vec::new());
        }
        let body = response.bytes().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
        parse_multistatus(&body)
    }
}

/// Turns an `href` into a path relative to the server root.
fn href_to_path(href: &str) -> String {
    let path = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    path.trim_start_matches('/').to_string()
}

fn parse_multistatus(xml: &[u8]) -> Result<Vec<DavEntry>> {
    let malformed = |e: String| exn::Exn::from(ErrorKind::InvalidData(format!("malformed multistatus: {e}")));
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut entries = Vec::new();
    let mut entry: Option<DavEntry> = None;
    let mut in_prop = false;
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| malformed(e.to_string()))? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "response" => entry = Some(DavEntry { path: String::new(), is_folder: false, props: Map::new() }),
                    "prop" => in_prop = true,
                    "collection" => {
                        if let Some(entry) = entry.as_mut() {
                            entry.is_folder = true;
                        }
                    }
                    _ => current = Some(name),
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection"
                    && let Some(entry) = entry.as_mut()
                {
                    entry.is_folder = true;
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| malformed(e.to_string()))?.into_owned();
                if let (Some(field), Some(entry)) = (current.as_deref(), entry.as_mut()) {
                    if field == "href" && !in_prop {
                        entry.path = href_to_path(&text);
                    } else if in_prop {
                        entry.props.insert(format!("{{DAV:}}{field}"), text.into());
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => entries.extend(entry.take()),
                b"prop" => in_prop = false,
                _ => current = None,
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }
    Ok(entries)
}

#[async_trait]
impl Source for WebDavSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"base_url": self.base_url, "user": self.user})
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self { password: None, ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("base_url".into(), self.base_url.clone().into());
        obj.insert("user".into(), self.user.clone().into());
        obj.insert("password".into(), self.password.clone().into());
        obj
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let base = Url::parse(&self.base_url).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))?;
        Ok(Opened::new(DavState {
            client: sm.http().client()?,
            base,
            user: self.user.clone(),
            password: self.password.clone(),
        }))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        Box::pin(stream! {
            let state = match sm.open_as::<DavState>(self.as_ref()).await {
                Ok(state) => state,
                Err(e) => { yield Err(e); return; }
            };
            let root = href_to_path(state.base.path()).trim_end_matches('/').to_string();
            let mut visited = std::collections::HashSet::new();
            let mut directories = vec![root];
            let source: SourceRef = self;
            while let Some(directory) = directories.pop() {
                visited.insert(directory.clone());
                let entries = match state.ls(&directory).await {
                    Ok(entries) => entries,
                    Err(e) => { yield Err(e); continue; }
                };
                for entry in entries {
                    if entry.is_folder {
                        let folder = entry.path.trim_end_matches('/').to_string();
                        if !visited.contains(&folder) && !directories.contains(&folder) {
                            directories.push(folder);
                        }
                    } else if !entry.path.is_empty() {
                        yield Ok(Handle::new(source.clone(), entry.path).with_hints(Some(entry.props)));
                    }
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(DavResource { handle: handle.clone(), sm, props: OnceCell::new() })
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        match handle.hint(DISPLAY_NAME).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => handle.name().to_string(),
        }
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        let folder = handle.relative_path.rsplit_once('/').map(|(folder, _)| folder).unwrap_or("");
        format!("WebDAV folder '{folder}'")
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        let base = Url::parse(&self.base_url).ok()?;
        base.join(&format!("/{}", handle.relative_path)).ok().map(String::from)
    }
}

struct DavResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
    props: OnceCell<Map<String, Value>>,
}

impl DavResource<'_> {
    async fn state(&self) -> Result<Arc<DavState>> {
        self.sm.open_as::<DavState>(self.handle.source.as_ref()).await
    }

    /// A property from the enumeration hints, or else from a fresh listing.
    async fn prop(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.handle.hint(key).and_then(Value::as_str) {
            return Ok(Some(value.to_string()));
        }
        let props = self
            .props
            .get_or_try_init(|| async {
                let state = self.state().await?;
                let entry = state.ls(&self.handle.relative_path).await?.into_iter().next();
                Ok::<_, crate::error::Error>(entry.map(|e| e.props).unwrap_or_default())
            })
            .await?;
        Ok(props.get(key).and_then(Value::as_str).map(str::to_string))
    }
}

#[async_trait]
impl Resource for DavResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let state = self.state().await?;
        let url = state.url(&self.handle.relative_path)?;
        let response = send_throttled(|| state.request(reqwest::Method::HEAD, url.clone())).await?;
        Ok(!matches!(response.status().as_u16(), 404 | 410))
    }

    async fn size(&self) -> Result<u64> {
        let size = self.prop(CONTENT_LENGTH).await?;
        size.and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidData("server reported no content length".into())))
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self.prop(LAST_MODIFIED).await?.as_deref().and_then(parse_http_date))
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let state = self.state().await?;
        let url = state.url(&self.handle.relative_path)?;
        let response = check_status(send_throttled(|| state.request(reqwest::Method::GET, url.clone())).await?)?;
        let body = response.bytes().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
        Ok(cursor(body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/reports/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>http://dav.example.invalid/dav/notes%20v2.txt</d:href>
    <d:propstat><d:prop>
      <d:resourcetype/>
      <d:getcontentlength>42</d:getcontentlength>
      <d:getlastmodified>Wed, 21 Oct 2015 07:28:00 GMT</d:getlastmodified>
      <d:displayname>notes v2.txt</d:displayname>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus() {
        let entries = parse_multistatus(MULTISTATUS.as_bytes()).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_folder && entries[0].path == "dav/");
        assert!(entries[1].is_folder && entries[1].path == "dav/reports/");
        let file = &entries[2];
        assert!(!file.is_folder);
        assert_eq!(file.path, "dav/notes%20v2.txt");
        assert_eq!(file.props[CONTENT_LENGTH], "42");
        assert_eq!(file.props[DISPLAY_NAME], "notes v2.txt");
    }

    #[test]
    fn test_presentation() {
        let source: SourceRef = Arc::new(WebDavSource::new("https://dav.example.invalid/dav/"));
        let hints = parse_multistatus(MULTISTATUS.as_bytes()).unwrap().remove(2).props;
        let handle = Handle::new(source, "dav/notes%20v2.txt").with_hints(Some(hints));
        assert_eq!(handle.presentation_name(), "notes v2.txt");
        assert_eq!(handle.presentation_place(), "WebDAV folder 'dav'");
        assert_eq!(handle.presentation_url().as_deref(), Some("https://dav.example.invalid/dav/notes%20v2.txt"));
    }

    #[tokio::test]
    async fn test_hinted_properties_need_no_request() {
        let source: SourceRef = Arc::new(WebDavSource::new("https://dav.example.invalid/dav/"));
        let hints = parse_multistatus(MULTISTATUS.as_bytes()).unwrap().remove(2).props;
        let handle = Handle::new(source, "dav/notes%20v2.txt").with_hints(Some(hints));
        let sm = SourceManager::default();
        let resource = handle.follow(&sm);
        assert_eq!(resource.size().await.unwrap(), 42);
        assert_eq!(resource.last_modified().await.unwrap().unwrap().unix_timestamp(), 1_445_412_480);
    }

    #[test]
    fn test_censor() {
        let source = WebDavSource::new("https://dav.example.invalid/").with_credentials("u", "secret");
        assert_eq!(source.censor().to_json()["password"], Value::Null);
    }
}
