//! SharePoint lists.
//!
//! Document libraries are lists too, but they are scanned as drives, so
//! they are left out here along with the site's internal catalogs.

use super::{GraphClient, GraphCredentials, PAGE_SIZE, from_value, graph_client, warn_on_error};
use crate::error::Result;
use crate::handle::Handle;
use crate::http::parse_rfc3339;
use crate::manager::SourceManager;
use crate::mime::GRAPH_LIST;
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
use time::OffsetDateTime;
use tokio::sync::OnceCell;

pub const LABEL: &str = "msgraph-lists";
pub const LIST_LABEL: &str = "msgraph-list";
pub const ITEM_LABEL: &str = "msgraph-list-item";

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, GraphListsSource::decode);
    registry.register_source(LIST_LABEL, GraphListSource::decode);
    registry.register_mime(GRAPH_LIST, |h| Arc::new(GraphListSource::new(h)));
}

/// Every list on the non-personal SharePoint sites of a tenant. Handles are
/// lists, each scanned through a [`GraphListSource`].
#[derive(Clone, Debug)]
pub struct GraphListsSource {
    credentials: GraphCredentials,
}

#[derive(Debug, Default, Deserialize)]
struct Identity {
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    display_name: Option<String>,
    email: Option<String>,
}

impl Identity {
    fn display_name(&self) -> Option<String> {
        self.user.as_ref()?.display_name.clone()
    }

    fn email(&self) -> Option<String> {
        self.user.as_ref()?.email.clone()
    }
}

#[derive(Debug, Deserialize)]
struct ListTemplate {
    template: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct List {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    web_url: String,
    list: Option<ListTemplate>,
    #[serde(default)]
    created_by: Identity,
    #[serde(default)]
    last_modified_by: Identity,
}

impl List {
    fn scannable(&self) -> bool {
        let template = self.list.as_ref().and_then(|l| l.template.as_deref());
        template != Some("documentLibrary") && !self.web_url.contains("_catalogs")
    }

    /// The last editor if known, otherwise the creator.
    fn owner_name(&self) -> Option<String> {
        self.last_modified_by.display_name().or_else(|| self.created_by.display_name())
    }
}

impl GraphListsSource {
    pub fn new(credentials: GraphCredentials) -> Self {
        Self { credentials }
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(GraphCredentials::decode(obj)?)))
    }

    fn list_handle(self: &Arc<Self>, list: List, site_id: &str) -> Handle {
        let source: SourceRef = self.clone();
        let owner_name = list.owner_name();
        Handle::new(source, list.id)
            .with_extra("list_name", list.display_name.or(list.name).unwrap_or_default())
            .with_extra("owner_name", owner_name)
            .with_extra("site_id", site_id.to_string())
    }

    async fn site_lists(&self, client: &GraphClient, site_id: &str) -> Result<Vec<List>> {
        let mut lists = Vec::new();
        let mut pages = client.paginated(client.endpoint(&format!("sites/{site_id}/lists?$top={PAGE_SIZE}")));
        while let Some(list) = pages.next().await {
            let list: List = from_value(list?)?;
            if list.scannable() {
                lists.push(list);
            }
        }
        Ok(lists)
    }
}

#[async_trait]
impl Source for GraphListsSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        LIST_LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({"tenant_id": self.credentials.tenant_id, "client_id": self.credentials.client_id})
    }

    fn yields_independent_sources(&self) -> bool {
        true
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self::new(self.credentials.censor()))
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        self.credentials.write_json(&mut obj);
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
            let mut sites = client.paginated(client.endpoint("sites/getAllSites?$filter=isPersonalSite ne true"));
            while let Some(site) = sites.next().await {
                let site = match site {
                    Ok(site) => site,
                    Err(e) => { yield Err(e); return; }
                };
                // Site ids are "hostname,site id,web id".
                let Some(site_id) = site.get("id").and_then(Value::as_str).and_then(|id| id.split(',').nth(1)) else {
                    continue;
                };
                for list in warn_on_error("SharePoint list check", site_id, self.site_lists(&client, site_id).await).unwrap_or_default() {
                    yield Ok(self.list_handle(list, site_id));
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(ListResource { handle: handle.clone(), sm })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        GRAPH_LIST.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        match (handle.extra_str("list_name").filter(|n| !n.is_empty()), handle.extra_str("owner_name")) {
            (Some(name), _) => format!("List: {name}"),
            (None, Some(owner)) => format!("list {} (owned by {owner})", handle.relative_path),
            (None, None) => format!("list {}", handle.relative_path),
        }
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        "SharePoint".into()
    }

    fn sort_key(&self, handle: &Handle) -> String {
        handle.extra_str("list_name").unwrap_or(&handle.relative_path).to_string()
    }
}

fn site_id(handle: &Handle) -> &str {
    handle.extra_str("site_id").unwrap_or_default()
}

struct ListResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

#[async_trait]
impl Resource for ListResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
        let url = client.endpoint(&format!("sites/{}/lists/{}?$select=id", site_id(&self.handle), self.handle.relative_path))?;
        match client.get(url).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(0)
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(GRAPH_LIST.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(Vec::new()))
    }
}

/// The items of one SharePoint list.
#[derive(Clone, Debug)]
pub struct GraphListSource {
    handle: Handle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemRef {
    id: String,
    #[serde(default)]
    web_url: Option<String>,
}

impl GraphListSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }

    fn list_path(&self) -> String {
        format!("sites/{}/lists/{}", site_id(&self.handle), self.handle.relative_path)
    }

    fn list_name(&self) -> &str {
        self.handle.extra_str("list_name").unwrap_or_default()
    }
}

#[async_trait]
impl Source for GraphListSource {
    fn type_label(&self) -> &'static str {
        LIST_LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        ITEM_LABEL
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
            let source: SourceRef = self.clone();
            let query = format!("{}/items?$select=id,webUrl&$top={PAGE_SIZE}", self.list_path());
            let mut items = client.paginated(client.endpoint(&query));
            while let Some(item) = items.next().await {
                let item: ItemRef = match item.and_then(from_value) {
                    Ok(item) => item,
                    Err(e) => { yield Err(e); return; }
                };
                yield Ok(Handle::new(source.clone(), item.id).with_extra("web_url", item.web_url));
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        let path = format!("{}/items/{}", self.list_path(), handle.relative_path);
        Box::new(ItemResource { handle: handle.clone(), path, sm, item: OnceCell::new() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        "application/json".into()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        format!("item {} of \"{}\"", handle.relative_path, self.list_name())
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        self.handle.to_string()
    }

    /// Item links point into the list's item view; the list itself is the
    /// stable part.
    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        let url = handle.extra_str("web_url")?;
        let list = url.split_once(&format!("/{}", handle.relative_path)).map_or(url, |(list, _)| list);
        Some(list.to_string())
    }

    fn sort_key(&self, handle: &Handle) -> String {
        format!("{}/{}", self.handle.sort_key(), handle.relative_path)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    #[serde(default)]
    fields: Map<String, Value>,
    last_modified_date_time: Option<String>,
    #[serde(default)]
    created_by: Identity,
    #[serde(default)]
    last_modified_by: Identity,
}

impl Item {
    /// The item's columns as JSON, without SharePoint's bookkeeping fields.
    fn content(&self) -> Vec<u8> {
        let columns: Map<String, Value> =
            self.fields.iter().filter(|(k, _)| !k.starts_with(['@', '_'])).map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::to_vec(&columns).unwrap_or_default()
    }
}

struct ItemResource<'a> {
    handle: Handle,
    path: String,
    sm: &'a SourceManager,
    item: OnceCell<Item>,
}

impl ItemResource<'_> {
    async fn item(&self) -> Result<&Item> {
        self.item
            .get_or_try_init(|| async {
                let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
                client.get_json(client.endpoint(&format!("{}?$expand=fields", self.path))?).await
            })
            .await
    }
}

#[async_trait]
impl Resource for ItemResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        match self.item().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.item().await?.content().len() as u64)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self.item().await?.last_modified_date_time.as_deref().and_then(parse_rfc3339))
    }

    async fn compute_type(&self) -> Result<String> {
        Ok("application/json".into())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(self.item().await?.content()))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let item = self.item().await?;
        let mut metadata = Map::new();
        if let Some(owner) = item.created_by.email() {
            metadata.insert("msgraph-owner-account".into(), owner.into());
        }
        if let Some(editor) = item.last_modified_by.email() {
            metadata.insert("msgraph-last-modified-by".into(), editor.into());
        }
        if let Some(at) = &item.last_modified_date_time {
            metadata.insert("msgraph-last-modified-date-time".into(), at.clone().into());
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> Arc<GraphListsSource> {
        Arc::new(GraphListsSource::new(GraphCredentials::new("id", "tenant", "secret")))
    }

    fn list() -> Handle {
        let list: List = serde_json::from_value(json!({
            "id": "b8f5-list",
            "displayName": "Contacts",
            "webUrl": "https://contoso.sharepoint.com/sites/hr/Lists/Contacts",
            "list": {"template": "contacts"},
            "createdBy": {"user": {"displayName": "Ann"}},
        }))
        .unwrap();
        tenant().list_handle(list, "c0ffee")
    }

    #[test]
    fn test_scannable_lists() {
        let decode = |value: Value| serde_json::from_value::<List>(value).unwrap();
        let library = decode(json!({"id": "1", "webUrl": "https://x/Shared Documents", "list": {"template": "documentLibrary"}}));
        let catalog = decode(json!({"id": "2", "webUrl": "https://x/_catalogs/users", "list": {"template": "genericList"}}));
        let plain = decode(json!({"id": "3", "webUrl": "https://x/Lists/Tasks", "list": {"template": "genericList"}}));
        assert!(!library.scannable());
        assert!(!catalog.scannable());
        assert!(plain.scannable());
        assert_eq!(plain.owner_name(), None);
    }

    #[test]
    fn test_list_handle() {
        let list = list();
        assert_eq!(list.presentation_name(), "List: Contacts");
        assert_eq!(list.presentation_place(), "SharePoint");
        assert_eq!(list.extra_str("owner_name"), Some("Ann"));
        assert_eq!(list.guess_type(), GRAPH_LIST);
        let derived = Registry::default().source_for_mime(&list, GRAPH_LIST).unwrap();
        assert_eq!(derived.type_label(), LIST_LABEL);
        assert_eq!(derived.handle_type_label(), ITEM_LABEL);
    }

    #[test]
    fn test_item_presentation() {
        let source = Arc::new(GraphListSource::new(list()));
        assert_eq!(source.list_path(), "sites/c0ffee/lists/b8f5-list");
        let item = Handle::new(source, "7").with_extra("web_url", "https://contoso.sharepoint.com/sites/hr/Lists/Contacts/7_.000");
        assert_eq!(item.presentation_name(), "item 7 of \"Contacts\"");
        assert_eq!(item.presentation_url().as_deref(), Some("https://contoso.sharepoint.com/sites/hr/Lists/Contacts"));
        assert_eq!(item.sort_key(), "Contacts/7");
    }

    #[test]
    fn test_round_trip_and_censor() {
        let registry = Registry::default();
        let item = Handle::new(Arc::new(GraphListSource::new(list())), "7");
        let decoded = registry.decode_handle(&item.to_json()).unwrap();
        assert_eq!(decoded, item);
        assert_eq!(decoded.source.handle().and_then(|h| h.extra_str("site_id")), Some("c0ffee"));

        let censored = item.censor().to_json();
        let tenant = &censored["source"]["handle"]["source"];
        assert_eq!(tenant["type"], LABEL);
        assert_eq!(tenant["client_secret"], Value::Null);
    }

    #[test]
    fn test_item_content_skips_bookkeeping() {
        let item: Item = serde_json::from_value(json!({
            "fields": {"@odata.etag": "\"1\"", "_UIVersionString": "1.0", "Title": "Ann", "Phone": "555"},
            "lastModifiedDateTime": "2024-03-01T10:00:00Z",
            "createdBy": {"user": {"email": "ann@example.invalid"}},
        }))
        .unwrap();
        let content: Value = serde_json::from_slice(&item.content()).unwrap();
        assert_eq!(content, json!({"Title": "Ann", "Phone": "555"}));
        assert_eq!(item.created_by.email().as_deref(), Some("ann@example.invalid"));
        assert!(item.last_modified_by.email().is_none());
    }
}
