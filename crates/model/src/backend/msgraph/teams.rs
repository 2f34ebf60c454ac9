//! Microsoft Teams chats.
//!
//! A chat is scanned as one document: its messages rendered oldest first
//! into a single HTML page.

use super::{GraphClient, GraphCredentials, decode_userlist, from_value, graph_client, has_any, warn_on_error};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::http::parse_rfc3339;
use crate::manager::SourceManager;
use crate::registry::Registry;
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

pub const LABEL: &str = "msgraph-chat";
/// Messages per page; Graph caps chat message pages at 50.
const MESSAGE_PAGE_SIZE: u32 = 50;

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, GraphChatSource::decode);
}

/// Every chat that the users of a tenant, or a list of users, take part in.
#[derive(Clone, Debug)]
pub struct GraphChatSource {
    credentials: GraphCredentials,
    userlist: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRef {
    id: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    chat_type: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

impl GraphChatSource {
    pub fn new(credentials: GraphCredentials) -> Self {
        Self { credentials, userlist: None }
    }

    pub fn with_userlist(mut self, users: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut users: Vec<String> = users.into_iter().map(Into::into).collect();
        users.sort();
        users.dedup();
        self.userlist = Some(users);
        self
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self { credentials: GraphCredentials::decode(obj)?, userlist: decode_userlist(obj) }))
    }

    async fn user_chats(&self, client: &GraphClient, upn: &str) -> Result<Vec<ChatRef>> {
        let mut chats = Vec::new();
        let mut pages = client.paginated(client.endpoint(&format!("users/{upn}/chats")));
        while let Some(chat) = pages.next().await {
            chats.push(from_value(chat?)?);
        }
        Ok(chats)
    }
}

async fn has_messages(client: &GraphClient, chat_id: &str) -> Result<bool> {
    has_any(client, &format!("chats/{chat_id}/messages?$top=1")).await
}

#[async_trait]
impl Source for GraphChatSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({
            "tenant_id": self.credentials.tenant_id,
            "client_id": self.credentials.client_id,
            "userlist": self.userlist,
        })
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self { credentials: self.credentials.censor(), ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        self.credentials.write_json(&mut obj);
        obj.insert("userlist".into(), json!(self.userlist));
        obj
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        Ok(Opened::new(GraphClient::new(sm.http().client()?, self.credentials.clone())?))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        Box::pin(stream! {
            let client = match sm.open_as::<GraphClient>(self.as_ref()).await {
                Ok(client) => client,
                Err(e) => { yield Err(e); return; }
            };
            let source: SourceRef = self.clone();
            // Group chats show up once per member.
            let mut seen = HashSet::new();
            let mut users = client.users(self.userlist.as_deref());
            while let Some(upn) = users.next().await {
                let upn = match upn {
                    Ok(upn) => upn,
                    Err(e) => { yield Err(e); return; }
                };
                for chat in warn_on_error("chat listing", &upn, self.user_chats(&client, &upn).await).unwrap_or_default() {
                    if !seen.insert(chat.id.clone()) {
                        continue;
                    }
                    if warn_on_error("chat check", &chat.id, has_messages(&client, &chat.id).await) != Some(true) {
                        continue;
                    }
                    yield Ok(Handle::new(source.clone(), chat.id)
                        .with_extra("topic", chat.topic)
                        .with_extra("chat_type", chat.chat_type)
                        .with_extra("web_url", chat.web_url));
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(ChatResource { handle: handle.clone(), sm, transcript: OnceCell::new() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        "text/html".into()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        match handle.extra_str("topic").filter(|t| !t.is_empty()) {
            Some(topic) => topic.to_string(),
            None => match handle.extra_str("chat_type") {
                Some(kind) => format!("{kind} chat {}", handle.relative_path),
                None => format!("chat {}", handle.relative_path),
            },
        }
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        "Microsoft Teams".into()
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        handle.extra_str("web_url").map(str::to_string)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sender {
    user: Option<Named>,
    application: Option<Named>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Named {
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Body {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Message {
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    created_date_time: String,
    #[serde(default)]
    from: Option<Sender>,
    #[serde(default)]
    body: Body,
}

impl Message {
    fn sender(&self) -> &str {
        self.from
            .as_ref()
            .and_then(|f| f.user.as_ref().or(f.application.as_ref()))
            .and_then(|n| n.display_name.as_deref())
            .unwrap_or("unknown")
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Renders user messages as HTML. Graph lists the newest message first.
fn transcript(messages: &[Message]) -> String {
    let mut html = String::from("<html><body>\n");
    for message in messages.iter().rev().filter(|m| m.message_type.as_deref().is_none_or(|t| t == "message")) {
        let body = if message.body.content_type.eq_ignore_ascii_case("html") {
            message.body.content.clone()
        } else {
            escape_html(&message.body.content)
        };
        let _ = writeln!(
            html,
            "<div><p><b>{}</b> {}</p>{}</div>",
            escape_html(message.sender()),
            escape_html(&message.created_date_time),
            body
        );
    }
    html.push_str("</body></html>\n");
    html
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Chat {
    last_updated_date_time: Option<String>,
}

struct ChatResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
    transcript: OnceCell<String>,
}

impl ChatResource<'_> {
    async fn transcript(&self) -> Result<&str> {
        let html = self
            .transcript
            .get_or_try_init(|| async {
                let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
                let path = format!("chats/{}/messages?$top={MESSAGE_PAGE_SIZE}", self.handle.relative_path);
                let mut pages = client.paginated(client.endpoint(&path));
                let mut messages = Vec::new();
                while let Some(message) = pages.next().await {
                    messages.push(from_value::<Message>(message?)?);
                }
                Ok::<_, Error>(transcript(&messages))
            })
            .await?;
        Ok(html)
    }
}

#[async_trait]
impl Resource for ChatResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
        has_messages(&client, &self.handle.relative_path).await
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.transcript().await?.len() as u64)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
        let chat: Chat = client.get_json(client.endpoint(&format!("chats/{}", self.handle.relative_path))?).await?;
        Ok(chat.last_updated_date_time.as_deref().and_then(parse_rfc3339))
    }

    async fn compute_type(&self) -> Result<String> {
        Ok("text/html".into())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(self.transcript().await?.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tenant() -> Arc<GraphChatSource> {
        Arc::new(GraphChatSource::new(GraphCredentials::new("id", "tenant", "secret")).with_userlist(["eve@example.invalid"]))
    }

    #[rstest]
    #[case(Some("Quarterly numbers"), Some("group"), "Quarterly numbers")]
    #[case(Some(""), Some("oneOnOne"), "oneOnOne chat 19:abc")]
    #[case(None, None, "chat 19:abc")]
    fn test_presentation_name(#[case] topic: Option<&str>, #[case] kind: Option<&str>, #[case] expected: &str) {
        let chat = Handle::new(tenant(), "19:abc").with_extra("topic", topic).with_extra("chat_type", kind);
        assert_eq!(chat.presentation_name(), expected);
        assert_eq!(chat.presentation_place(), "Microsoft Teams");
    }

    #[test]
    fn test_round_trip_and_censor() {
        let registry = Registry::default();
        let chat = Handle::new(tenant(), "19:abc")
            .with_extra("topic", "Quarterly numbers")
            .with_extra("web_url", "https://teams.microsoft.com/l/chat/19:abc");
        let decoded = registry.decode_handle(&chat.to_json()).unwrap();
        assert_eq!(decoded, chat);
        assert_eq!(decoded.presentation_url(), chat.presentation_url());
        assert!(!decoded.source.yields_independent_sources());

        let censored = chat.censor().to_json();
        assert_eq!(censored["source"]["type"], LABEL);
        assert_eq!(censored["source"]["client_secret"], Value::Null);
        assert_eq!(censored["source"]["userlist"], json!(["eve@example.invalid"]));
    }

    #[test]
    fn test_transcript() {
        let messages: Vec<Message> = serde_json::from_value(json!([
            {
                "messageType": "message",
                "createdDateTime": "2024-03-01T09:06:00Z",
                "from": {"user": {"displayName": "Bob"}},
                "body": {"contentType": "html", "content": "<p>fine</p>"}
            },
            {
                "messageType": "systemEventMessage",
                "createdDateTime": "2024-03-01T09:05:30Z",
                "body": {"contentType": "html", "content": "<systemEventMessage/>"}
            },
            {
                "messageType": "message",
                "createdDateTime": "2024-03-01T09:05:00Z",
                "from": {"user": {"displayName": "Eve"}},
                "body": {"contentType": "text", "content": "cpr 1111<2222 & co"}
            }
        ]))
        .unwrap();
        let html = transcript(&messages);
        let eve = html.find("<b>Eve</b>").unwrap();
        let bob = html.find("<b>Bob</b>").unwrap();
        assert!(eve < bob);
        assert!(html.contains("cpr 1111&lt;2222 &amp; co"));
        assert!(html.contains("<p>fine</p>"));
        assert!(!html.contains("systemEventMessage"));
    }
}
