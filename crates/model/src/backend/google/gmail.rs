//! Gmail mailboxes. Each handle is one message, identified by its Gmail id.

use super::{GoogleClient, ServiceAccount, account_sort_prefix};
use crate::backend::mail;
use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::manager::SourceManager;
use crate::registry::{Registry, opt_bool, str_field};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

pub const LABEL: &str = "gmail";
const SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const API: &str = "https://gmail.googleapis.com/gmail/v1/users";
const SKIPPED_LABELS: [&str; 2] = ["TRASH", "DRAFT"];

#[derive(Clone, Debug)]
pub struct GmailSource {
    grant: Option<Value>,
    user_email: String,
    scan_attachments: bool,
}

#[derive(Deserialize)]
struct Labels {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct Label {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageMetadata {
    #[serde(default)]
    size_estimate: u64,
    /// Milliseconds since the epoch, as a string.
    internal_date: Option<String>,
    payload: Option<Payload>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Clone, Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

impl MessageMetadata {
    fn header(&self, name: &str) -> Option<&str> {
        let payload = self.payload.as_ref()?;
        payload.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }
}

#[derive(Deserialize)]
struct RawMessage {
    raw: String,
}

/// Gmail's `raw` format is URL-safe base64, with or without padding.
fn decode_raw(raw: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|e| exn::Exn::from(ErrorKind::InvalidData(format!("undecodable message: {e}"))))
}

impl GmailSource {
    pub fn new(grant: Option<Value>, user_email: impl Into<String>, scan_attachments: bool) -> Self {
        Self { grant, user_email: user_email.into(), scan_attachments }
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(
            obj.get("google_api_grant").cloned(),
            str_field(obj, "user_email")?,
            opt_bool(obj, "scan_attachments", true),
        )))
    }

    fn messages_url(&self) -> String {
        format!("{API}/{}/messages", self.user_email)
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, GmailSource::decode);
}

#[async_trait]
impl Source for GmailSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"user_email": self.user_email})
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self { grant: None, ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("google_api_grant".into(), self.grant.clone().unwrap_or(Value::Null));
        obj.insert("user_email".into(), self.user_email.clone().into());
        obj.insert("scan_attachments".into(), self.scan_attachments.into());
        obj
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let account = ServiceAccount::from_grant(self.grant.as_ref())?;
        Ok(Opened::new(GoogleClient::new(sm.http().client()?, account, &self.user_email, SCOPE)))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, rule: Option<&'a Rule>) -> HandleStream<'a> {
        // Gmail search only has day resolution; the processor still checks
        // the exact cutoff.
        let query = rule.and_then(Rule::last_modified_cutoff).map(|c| format!("after:{}", c.unix_timestamp()));
        Box::pin(stream! {
            let client = match sm.open_as::<GoogleClient>(self.as_ref()).await {
                Ok(client) => client,
                Err(e) => { yield Err(e); return; }
            };
            let labels: Labels = match client.get_json(&format!("{API}/{}/labels", self.user_email), &[]).await {
                Ok(labels) => labels,
                Err(e) => { yield Err(e); return; }
            };
            let mut seen = HashSet::new();
            for label in labels.labels.into_iter().filter(|l| !SKIPPED_LABELS.contains(&l.id.as_str())) {
                let mut page_token: Option<String> = None;
                loop {
                    let mut params = vec![("labelIds", label.id.clone()), ("maxResults", "500".to_string())];
                    params.extend(query.clone().map(|q| ("q", q)));
                    params.extend(page_token.take().map(|t| ("pageToken", t)));
                    let page: MessageList = match client.get_json(&self.messages_url(), &params).await {
                        Ok(page) => page,
                        Err(e) => { yield Err(e); break; }
                    };
                    for message in page.messages {
                        if !seen.insert(message.id.clone()) {
                            continue;
                        }
                        let url = format!("{}/{}", self.messages_url(), message.id);
                        let params = [("format", "metadata".to_string()), ("metadataHeaders", "Subject".to_string())];
                        let subject = match client.get_json::<MessageMetadata>(&url, &params).await {
                            Ok(meta) => meta.header("Subject").unwrap_or_default().to_string(),
                            Err(e) => { yield Err(e); continue; }
                        };
                        let source: SourceRef = self.clone();
                        yield Ok(Handle::new(source, message.id)
                            .with_extra("mail_subject", subject)
                            .with_extra("scan_attachments", self.scan_attachments));
                    }
                    match page.next_page_token {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(GmailResource { handle: handle.clone(), source: self.clone(), sm, metadata: OnceCell::new() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        mail::MIME.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        format!("\"{}\"", handle.extra_str("mail_subject").unwrap_or_default())
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        format!("account {}", self.user_email)
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        Some(format!("https://mail.google.com/mail/#inbox/{}", handle.relative_path))
    }

    fn sort_key(&self, handle: &Handle) -> String {
        format!("{}/{}", account_sort_prefix(&self.user_email), handle.extra_str("mail_subject").unwrap_or_default())
    }
}

struct GmailResource<'a> {
    handle: Handle,
    source: GmailSource,
    sm: &'a SourceManager,
    metadata: OnceCell<MessageMetadata>,
}

impl GmailResource<'_> {
    fn url(&self) -> String {
        format!("{}/{}", self.source.messages_url(), self.handle.relative_path)
    }

    async fn client(&self) -> Result<Arc<GoogleClient>> {
        self.sm.open_as::<GoogleClient>(&self.source).await
    }

    async fn message(&self) -> Result<&MessageMetadata> {
        self.metadata
            .get_or_try_init(|| async {
                let client = self.client().await?;
                client.get_json(&self.url(), &[("format", "metadata".to_string())]).await
            })
            .await
    }
}

#[async_trait]
impl Resource for GmailResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Gmail only estimates sizes.
    async fn size(&self) -> Result<u64> {
        Ok(self.message().await?.size_estimate)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        let millis = self.message().await?.internal_date.as_deref().and_then(|d| d.parse::<i128>().ok());
        Ok(millis.and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(ms * 1_000_000).ok()))
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(mail::MIME.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let client = self.client().await?;
        let message: RawMessage = client.get_json(&self.url(), &[("format", "raw".to_string())]).await?;
        Ok(cursor(decode_raw(&message.raw)?))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        metadata.insert("email-account".into(), self.source.user_email.clone().into());
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;

    fn source() -> SourceRef {
        Arc::new(GmailSource::new(Some(json!({"client_email": "x"})), "alice@example.invalid", false))
    }

    #[test]
    fn test_presentation() {
        let handle = Handle::new(source(), "18c2f").with_extra("mail_subject", "Quarterly numbers");
        assert_eq!(handle.presentation_name(), "\"Quarterly numbers\"");
        assert_eq!(handle.presentation_place(), "account alice@example.invalid");
        assert_eq!(handle.presentation_url().as_deref(), Some("https://mail.google.com/mail/#inbox/18c2f"));
        assert_eq!(handle.sort_key(), "example.invalid/alice/Quarterly numbers");
        assert_eq!(handle.guess_type(), "message/rfc822");
    }

    #[test]
    fn test_round_trip_and_censor() {
        let registry = Registry::default();
        let handle = Handle::new(source(), "18c2f")
            .with_extra("mail_subject", "Hi")
            .with_extra("scan_attachments", false);
        let decoded = registry.decode_handle(&handle.to_json()).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(decoded.extra_str("mail_subject"), Some("Hi"));

        let censored = handle.censor();
        assert_eq!(censored.to_json()["source"]["google_api_grant"], Value::Null);
        assert_eq!(censored, handle);
    }

    #[test]
    fn test_decode_raw() {
        let mail = "Subject: ?>?\r\n\r\nbody";
        assert_eq!(decode_raw(&URL_SAFE.encode(mail)).unwrap(), mail.as_bytes());
        assert_eq!(decode_raw(&URL_SAFE_NO_PAD.encode(mail)).unwrap(), mail.as_bytes());
    }

    #[test]
    fn test_subject_header() {
        let meta: MessageMetadata = serde_json::from_value(json!({
            "sizeEstimate": 1234,
            "internalDate": "1700000000000",
            "payload": {"headers": [{"name": "subject", "value": "Hello"}]}
        }))
        .unwrap();
        assert_eq!(meta.header("Subject"), Some("Hello"));
        assert_eq!(meta.size_estimate, 1234);
    }
}
