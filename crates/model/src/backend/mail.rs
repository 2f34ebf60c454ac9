//! RFC 822 mail messages, seen as a source of body parts and attachments.
//!
//! A part's path is its index walk through the MIME tree followed by its
//! file name, e.g. `1/0/report.pdf`; a body part without a file name has an
//! empty last component.

use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::mime::OCTET_STREAM;
use crate::registry::{Registry, field};
use crate::resource::{BoxSyncRead, Resource, cursor, read_all};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef, derived_eq_properties, derived_to_json};
use async_stream::stream;
use async_trait::async_trait;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde_json::{Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;

pub const LABEL: &str = "mail";
pub const HANDLE_LABEL: &str = "mail-part";
pub const MIME: &str = "message/rfc822";

#[derive(Clone, Debug)]
pub struct MailSource {
    handle: Handle,
}

/// The raw message. Parsing is cheap next to fetching, and a parsed message
/// borrows from its bytes, so parts are parsed again on each access.
#[derive(Debug)]
struct RawMail(Vec<u8>);

impl RawMail {
    fn parse(&self) -> Result<ParsedMail<'_>> {
        mailparse::parse_mail(&self.0).map_err(|e| exn::Exn::from(ErrorKind::InvalidData(e.to_string())))
    }
}

impl MailSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, MailSource::decode);
    registry.register_mime(MIME, |h| Arc::new(MailSource::new(h)));
}

fn is_text_body(parts: &[ParsedMail<'_>]) -> bool {
    parts.len() == 2 && parts[0].ctype.mimetype == "text/plain" && parts[1].ctype.mimetype == "text/html"
}

fn filename(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    let name = disposition.params.get("filename").or_else(|| part.ctype.params.get("name"))?;
    // Slashes would corrupt the index walk.
    Some(name.replace('/', "_"))
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
}

/// Collects `(path, mime)` for each leaf part, preferring the HTML body of a
/// plain text/HTML alternative.
fn collect_parts(part: &ParsedMail<'_>, path: &mut Vec<String>, scan_attachments: bool, out: &mut Vec<(String, String)>) {
    if !part.subparts.is_empty() {
        if part.ctype.mimetype == "multipart/alternative" && is_text_body(&part.subparts) {
            path.push("1".into());
            collect_parts(&part.subparts[1], path, scan_attachments, out);
            path.pop();
        } else {
            for (idx, sub) in part.subparts.iter().enumerate() {
                path.push(idx.to_string());
                collect_parts(sub, path, scan_attachments, out);
                path.pop();
            }
        }
        return;
    }
    if is_attachment(part) && !scan_attachments {
        return;
    }
    let mut components = path.clone();
    components.push(filename(part).unwrap_or_default());
    out.push((components.join("/"), part.ctype.mimetype.clone()));
}

/// Follows the index walk in `relative_path` down to a part.
fn find_part<'m>(mut part: &'m ParsedMail<'m>, relative_path: &str) -> Result<&'m ParsedMail<'m>> {
    let mut steps: Vec<&str> = relative_path.split('/').collect();
    steps.pop();
    for step in steps {
        let idx: usize = step.parse().map_err(|_| exn::Exn::from(ErrorKind::NotFound(relative_path.to_string())))?;
        part = part.subparts.get(idx).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(relative_path.to_string())))?;
    }
    Ok(part)
}

#[async_trait]
impl Source for MailSource {
    fn type_label(&self) -> &'static str {
        LABEL
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
        Arc::new(Self::new(self.handle.censor()))
    }

    fn to_json(&self) -> Map<String, Value> {
        derived_to_json(&self.handle)
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let raw = read_all(self.handle.follow(sm).stream().await?).await?;
        Ok(Opened::new(RawMail(raw)))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        Box::pin(stream! {
            let raw = match sm.open_as::<RawMail>(self.as_ref()).await {
                Ok(raw) => raw,
                Err(e) => { yield Err(e); return; }
            };
            let scan_attachments = self.handle.extra.get("scan_attachments").and_then(Value::as_bool).unwrap_or(true);
            let parts = raw.parse().map(|mail| {
                let mut out = Vec::new();
                collect_parts(&mail, &mut Vec::new(), scan_attachments, &mut out);
                out
            });
            let parts = match parts {
                Ok(parts) => parts,
                Err(e) => { yield Err(e); return; }
            };
            let source: SourceRef = self;
            for (path, mime) in parts {
                yield Ok(Handle::new(source.clone(), path).with_extra("mime", mime));
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(MailPartResource { handle: handle.clone(), sm })
    }

    fn guess_type(&self, handle: &Handle) -> String {
        match handle.extra_str("mime") {
            Some(mime) if mime != OCTET_STREAM => mime.to_string(),
            _ => crate::mime::guess_from_name(&handle.relative_path),
        }
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        let container = self.handle.presentation_name();
        match handle.relative_path.rsplit('/').next() {
            Some(name) if !name.is_empty() => format!("attachment \"{name}\" in {container}"),
            _ => container,
        }
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.handle.presentation_place()
    }

    fn sort_key(&self, _handle: &Handle) -> String {
        self.handle.sort_key()
    }
}

struct MailPartResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

impl MailPartResource<'_> {
    async fn body(&self) -> Result<Vec<u8>> {
        let raw = self.sm.open_as::<RawMail>(self.handle.source.as_ref()).await?;
        let mail = raw.parse()?;
        let part = find_part(&mail, &self.handle.relative_path)?;
        part.get_body_raw().map_err(|e| exn::Exn::from(ErrorKind::InvalidData(e.to_string())))
    }
}

#[async_trait]
impl Resource for MailPartResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.body().await?.len() as u64)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        match self.handle.source.handle() {
            Some(mail) => mail.follow(self.sm).last_modified().await,
            None => Ok(None),
        }
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(self.body().await?))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let raw = self.sm.open_as::<RawMail>(self.handle.source.as_ref()).await?;
        let mail = raw.parse()?;
        let mut metadata = Map::new();
        for (header, key) in [("Subject", "email-subject"), ("From", "email-from"), ("To", "email-to")] {
            if let Some(value) = mail.headers.get_first_value(header) {
                metadata.insert(key.into(), value.into());
            }
        }
        Ok(metadata)
    }
}
