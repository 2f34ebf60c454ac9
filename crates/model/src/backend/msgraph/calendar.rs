//! Outlook calendars.

use super::{
    GraphClient, GraphCredentials, PAGE_SIZE, account_sort_key, decode_userlist, from_value, graph_client, has_any,
    warn_on_error,
};
use crate::error::Result;
use crate::handle::Handle;
use crate::http::parse_rfc3339;
use crate::manager::SourceManager;
use crate::mime::GRAPH_CALENDAR_ACCOUNT;
use crate::registry::{Registry, field};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef, derived_eq_properties, derived_to_json};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::OnceCell;

pub const LABEL: &str = "msgraph-calendar";
pub const ACCOUNT_LABEL: &str = "msgraph-calendar-account";
pub const EVENT_LABEL: &str = "msgraph-calendar-event";
/// Graph reports no size for events.
const NOMINAL_SIZE: u64 = 1024;

const START_INPUT: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const START_OUTPUT: &[BorrowedFormatItem<'_>] =
    format_description!("[hour]:[minute] [day padding:none]/[month padding:none]/[year repr:last_two]");

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, GraphCalendarSource::decode);
    registry.register_source(ACCOUNT_LABEL, GraphCalendarAccountSource::decode);
    registry.register_mime(GRAPH_CALENDAR_ACCOUNT, |h| Arc::new(GraphCalendarAccountSource::new(h)));
}

/// The calendars of every user in a tenant, or of a list of users. Handles
/// are accounts, each scanned through a [`GraphCalendarAccountSource`].
#[derive(Clone, Debug)]
pub struct GraphCalendarSource {
    credentials: GraphCredentials,
    userlist: Option<Vec<String>>,
}

impl GraphCalendarSource {
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
}

async fn has_events(client: &GraphClient, upn: &str) -> Result<bool> {
    has_any(client, &format!("users/{upn}/events?$select=id&$top=1")).await
}

#[async_trait]
impl Source for GraphCalendarSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        ACCOUNT_LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"tenant_id": self.credentials.tenant_id, "userlist": self.userlist})
    }

    fn yields_independent_sources(&self) -> bool {
        true
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
            let mut users = client.users(self.userlist.as_deref());
            while let Some(upn) = users.next().await {
                let upn = match upn {
                    Ok(upn) => upn,
                    Err(e) => { yield Err(e); return; }
                };
                if warn_on_error("calendar check", &upn, has_events(&client, &upn).await) == Some(true) {
                    let source: SourceRef = self.clone();
                    yield Ok(Handle::new(source, upn));
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(AccountResource { handle: handle.clone(), sm })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        GRAPH_CALENDAR_ACCOUNT.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        handle.relative_path.clone()
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        "Microsoft 365".into()
    }

    fn sort_key(&self, handle: &Handle) -> String {
        account_sort_key(&handle.relative_path)
    }
}

struct AccountResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

#[async_trait]
impl Resource for AccountResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
        has_events(&client, &self.handle.relative_path).await
    }

    async fn size(&self) -> Result<u64> {
        Ok(0)
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(GRAPH_CALENDAR_ACCOUNT.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(Vec::new()))
    }
}

/// The events of one user's calendar.
#[derive(Clone, Debug)]
pub struct GraphCalendarAccountSource {
    handle: Handle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRef {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    web_link: Option<String>,
    start: Option<Value>,
}

impl GraphCalendarAccountSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }

    fn upn(&self) -> &str {
        &self.handle.relative_path
    }
}

/// An event's start as `09:05 1/3/24`, in the event's own time zone.
fn event_start(start: Option<&Value>) -> String {
    start
        .and_then(|s| s.get("dateTime"))
        .and_then(Value::as_str)
        .and_then(|s| PrimitiveDateTime::parse(s.split('.').next().unwrap_or(s), START_INPUT).ok())
        .and_then(|at| at.format(START_OUTPUT).ok())
        .unwrap_or_else(|| "Date NaN".into())
}

#[async_trait]
impl Source for GraphCalendarAccountSource {
    fn type_label(&self) -> &'static str {
        ACCOUNT_LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        EVENT_LABEL
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

    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        Ok(Opened::new(()))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, _rule: Option<&'a Rule>) -> HandleStream<'a> {
        Box::pin(stream! {
            let client = match graph_client(sm, self.as_ref()).await {
                Ok(client) => client,
                Err(e) => { yield Err(e); return; }
            };
            let query = format!("users/{}/events?$select=id,subject,webLink,start&$top={PAGE_SIZE}", self.upn());
            let source: SourceRef = self.clone();
            let mut events = client.paginated(client.endpoint(&query));
            while let Some(event) = events.next().await {
                let event: EventRef = match event.and_then(from_value) {
                    Ok(event) => event,
                    Err(e) => { yield Err(e); return; }
                };
                yield Ok(Handle::new(source.clone(), event.id)
                    .with_extra("event_subject", event.subject.unwrap_or_default())
                    .with_extra("weblink", event.web_link)
                    .with_extra("start", event.start));
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(EventResource { handle: handle.clone(), upn: self.upn().to_string(), sm, event: OnceCell::new() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        "text/html".into()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        format!("[{}] {}", event_start(handle.extra.get("start")), handle.extra_str("event_subject").unwrap_or_default())
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.handle.to_string()
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        handle.extra_str("weblink").map(str::to_string)
    }

    fn sort_key(&self, handle: &Handle) -> String {
        format!("{}calendar/{}", account_sort_key(self.upn()), handle.extra_str("event_subject").unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventBody {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    body: Option<EventBody>,
    last_modified_date_time: Option<String>,
}

struct EventResource<'a> {
    handle: Handle,
    upn: String,
    sm: &'a SourceManager,
    event: OnceCell<Event>,
}

impl EventResource<'_> {
    fn path(&self) -> String {
        format!("users/{}/events/{}", self.upn, self.handle.relative_path)
    }

    async fn event(&self) -> Result<&Event> {
        self.event
            .get_or_try_init(|| async {
                let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
                client.get_json(client.endpoint(&format!("{}?$select=body,lastModifiedDateTime", self.path()))?).await
            })
            .await
    }
}

#[async_trait]
impl Resource for EventResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        match self.event().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(NOMINAL_SIZE)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self.event().await?.last_modified_date_time.as_deref().and_then(parse_rfc3339))
    }

    async fn compute_type(&self) -> Result<String> {
        let html = self.event().await?.body.as_ref().is_none_or(|b| b.content_type.eq_ignore_ascii_case("html"));
        Ok(if html { "text/html" } else { "text/plain" }.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let content = self.event().await?.body.as_ref().map(|b| b.content.clone()).unwrap_or_default();
        Ok(cursor(content))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        metadata.insert("email-account".into(), self.upn.clone().into());
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn account() -> Handle {
        let tenant = GraphCalendarSource::new(GraphCredentials::new("id", "tenant", "secret")).with_userlist(["eve@example.invalid"]);
        Handle::new(Arc::new(tenant), "eve@example.invalid")
    }

    fn event() -> Handle {
        Handle::new(Arc::new(GraphCalendarAccountSource::new(account())), "AAMkEv1")
            .with_extra("event_subject", "Budget review")
            .with_extra("weblink", "https://outlook.office365.com/owa/?itemid=AAMkEv1")
            .with_extra("start", json!({"dateTime": "2024-03-01T09:05:00.0000000", "timeZone": "UTC"}))
    }

    #[test]
    fn test_account_becomes_source() {
        let account = account();
        assert_eq!(account.guess_type(), GRAPH_CALENDAR_ACCOUNT);
        assert_eq!(account.presentation_place(), "Microsoft 365");
        assert!(account.source.yields_independent_sources());

        let derived = Registry::default().source_for_mime(&account, GRAPH_CALENDAR_ACCOUNT).unwrap();
        assert_eq!(derived.type_label(), ACCOUNT_LABEL);
        assert_eq!(derived.handle_type_label(), EVENT_LABEL);
    }

    #[test]
    fn test_event_presentation() {
        let event = event();
        assert_eq!(event.presentation_name(), "[09:05 1/3/24] Budget review");
        assert_eq!(event.presentation_url().as_deref(), Some("https://outlook.office365.com/owa/?itemid=AAMkEv1"));
        assert_eq!(event.sort_key(), "example.invalid/eve/calendar/Budget review");
    }

    #[rstest]
    #[case(Some(json!({"dateTime": "2023-12-24T18:30:00", "timeZone": "Europe/Copenhagen"})), "18:30 24/12/23")]
    #[case(Some(json!({"dateTime": "tomorrow"})), "Date NaN")]
    #[case(None, "Date NaN")]
    fn test_event_start(#[case] start: Option<Value>, #[case] expected: &str) {
        assert_eq!(event_start(start.as_ref()), expected);
    }

    #[test]
    fn test_round_trip_and_censor() {
        let registry = Registry::default();
        let event = event();
        let decoded = registry.decode_handle(&event.to_json()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.presentation_name(), event.presentation_name());

        let censored = event.censor().to_json();
        let tenant = &censored["source"]["handle"]["source"];
        assert_eq!(tenant["type"], LABEL);
        assert_eq!(tenant["client_secret"], Value::Null);
        assert_eq!(tenant["tenant_id"], "tenant");
    }

    #[test]
    fn test_body_type() {
        let event: Event = serde_json::from_value(json!({
            "body": {"contentType": "text", "content": "Agenda"},
            "lastModifiedDateTime": "2024-03-01T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(event.body.unwrap().content_type, "text");
        assert!(event.last_modified_date_time.as_deref().and_then(parse_rfc3339).is_some());
    }
}
