//! OneDrive and SharePoint document libraries.

use super::{GraphClient, GraphCredentials, PAGE_SIZE, decode_userlist, graph_client, warn_on_error};
use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::http::parse_rfc3339;
use crate::manager::SourceManager;
use crate::mime::{GRAPH_FILES_DRIVE, guess_from_name};
use crate::registry::{Registry, field, opt_bool};
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
use url::Url;

pub const LABEL: &str = "msgraph-files";
pub const DRIVE_LABEL: &str = "msgraph-drive";
pub const FILE_LABEL: &str = "msgraph-drive-file";

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, GraphFilesSource::decode);
    registry.register_source(DRIVE_LABEL, GraphDriveSource::decode);
    registry.register_mime(GRAPH_FILES_DRIVE, |h| Arc::new(GraphDriveSource::new(h)));
}

/// The drives of a tenant: SharePoint site libraries, users' OneDrives,
/// or both. Handles are drives, each scanned through a [`GraphDriveSource`].
#[derive(Clone, Debug)]
pub struct GraphFilesSource {
    credentials: GraphCredentials,
    site_drives: bool,
    user_drives: bool,
    userlist: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Drive {
    id: String,
    #[serde(default)]
    name: String,
    owner: Option<Owner>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    user: Option<Identity>,
    group: Option<Identity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    display_name: Option<String>,
    email: Option<String>,
}

impl Drive {
    fn owner_name(&self) -> Option<String> {
        let owner = self.owner.as_ref()?;
        owner.user.as_ref().or(owner.group.as_ref())?.display_name.clone()
    }
}

impl GraphFilesSource {
    pub fn new(credentials: GraphCredentials, site_drives: bool, user_drives: bool) -> Self {
        Self { credentials, site_drives, user_drives, userlist: None }
    }

    pub fn with_userlist(mut self, users: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut users: Vec<String> = users.into_iter().map(Into::into).collect();
        users.sort();
        users.dedup();
        self.userlist = Some(users);
        self
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self {
            credentials: GraphCredentials::decode(obj)?,
            site_drives: opt_bool(obj, "site_drives", true),
            user_drives: opt_bool(obj, "user_drives", true),
            userlist: decode_userlist(obj),
        }))
    }

    fn drive_handle(self: &Arc<Self>, drive: &Drive, user_account: Option<&str>) -> Handle {
        let source: SourceRef = self.clone();
        Handle::new(source, drive.id.clone())
            .with_extra("folder_name", drive.name.clone())
            .with_extra("owner_name", drive.owner_name())
            .with_extra("user_account", user_account.map(str::to_string))
    }

    /// The document library of every non-personal SharePoint site.
    async fn site_drives(&self, client: &GraphClient) -> Result<Vec<Drive>> {
        #[derive(Deserialize)]
        struct Site {
            drive: Option<Drive>,
        }
        let mut drives = Vec::new();
        let mut sites = client.paginated(client.endpoint("sites/getAllSites?$filter=isPersonalSite ne true"));
        while let Some(site) = sites.next().await {
            let site = site?;
            // Site ids are "hostname,site id,web id".
            let Some(site_id) = site.get("id").and_then(Value::as_str).and_then(|id| id.split(',').nth(1)) else {
                continue;
            };
            let url = client.endpoint(&format!("sites/{site_id}?$select=id,drive&$expand=drive"))?;
            if let Some(drive) = warn_on_error("site drive check", site_id, client.get_json::<Site>(url).await).and_then(|s| s.drive) {
                drives.push(drive);
            }
        }
        Ok(drives)
    }
}

#[async_trait]
impl Source for GraphFilesSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        DRIVE_LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({
            "tenant_id": self.credentials.tenant_id,
            "client_id": self.credentials.client_id,
            "site_drives": self.site_drives,
            "user_drives": self.user_drives,
            "userlist": self.userlist,
        })
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
        obj.insert("site_drives".into(), self.site_drives.into());
        obj.insert("user_drives".into(), self.user_drives.into());
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
            if self.site_drives {
                for drive in warn_on_error("SharePoint drive listing", "*", self.site_drives(&client).await).unwrap_or_default() {
                    yield Ok(self.drive_handle(&drive, None));
                }
            }
            if self.user_drives {
                let mut users = client.users(self.userlist.as_deref());
                while let Some(upn) = users.next().await {
                    let upn = match upn {
                        Ok(upn) => upn,
                        Err(e) => { yield Err(e); return; }
                    };
                    let drive = client.endpoint(&format!("users/{upn}/drive"));
                    let drive = match drive {
                        Ok(url) => client.get_json::<Drive>(url).await,
                        Err(e) => Err(e),
                    };
                    if let Some(drive) = warn_on_error("drive check", &upn, drive) {
                        yield Ok(self.drive_handle(&drive, Some(&upn)));
                    }
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(DriveResource { handle: handle.clone(), sm })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        GRAPH_FILES_DRIVE.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        let folder = handle.extra_str("folder_name").unwrap_or_default();
        match (handle.extra_str("user_account"), handle.extra_str("owner_name")) {
            (Some(account), _) => format!("{account}'s files"),
            (None, Some(owner)) => format!("\"{folder}\" (owned by {owner})"),
            (None, None) => format!("\"{folder}\""),
        }
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        "Office 365".into()
    }
}

/// A drive as an object.
struct DriveResource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

#[async_trait]
impl Resource for DriveResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
        let url = client.endpoint(&format!("drives/{}?$select=id", self.handle.relative_path))?;
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
        Ok(GRAPH_FILES_DRIVE.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(Vec::new()))
    }
}

/// The files of one drive. Handle paths are `/`-separated paths from the
/// drive root.
#[derive(Clone, Debug)]
pub struct GraphDriveSource {
    handle: Handle,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    web_url: Option<String>,
    #[serde(default)]
    size: u64,
    last_modified_date_time: Option<String>,
    file: Option<Value>,
    folder: Option<Value>,
    created_by: Option<IdentitySet>,
    last_modified_by: Option<IdentitySet>,
}

#[derive(Debug, Deserialize)]
struct IdentitySet {
    user: Option<Identity>,
}

impl IdentitySet {
    fn email(set: &Option<IdentitySet>) -> Option<String> {
        set.as_ref()?.user.as_ref()?.email.clone()
    }
}

impl DriveItem {
    fn modified(&self) -> Option<OffsetDateTime> {
        self.last_modified_date_time.as_deref().and_then(parse_rfc3339)
    }
}

impl GraphDriveSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }

    /// `drives/{id}`, or the owner's default drive when the id is unknown.
    fn drive_path(&self) -> Result<Vec<String>> {
        if !self.handle.relative_path.is_empty() {
            return Ok(vec!["drives".into(), self.handle.relative_path.clone()]);
        }
        match self.handle.extra_str("user_account") {
            Some(upn) => Ok(vec!["users".into(), upn.to_string(), "drive".into()]),
            None => exn::bail!(ErrorKind::InvalidData(format!("drive {} has neither id nor owner", self.handle))),
        }
    }

    /// The URL of the item at `path`, optionally with a `:/suffix` action.
    fn item_url(&self, client: &GraphClient, path: &str, suffix: Option<&str>) -> Result<Url> {
        let mut segments = self.drive_path()?;
        segments.push("root:".into());
        segments.extend(path.split('/').map(str::to_string));
        if let Some(suffix) = suffix
            && let Some(last) = segments.last_mut()
        {
            last.push(':');
            segments.push(suffix.to_string());
        }
        client.endpoint_segments(segments.iter().map(String::as_str))
    }

    async fn children(&self, client: &GraphClient, folder_id: &str) -> Result<Vec<DriveItem>> {
        let mut segments = self.drive_path()?;
        segments.extend(["items".into(), folder_id.to_string(), "children".into()]);
        let mut url = client.endpoint_segments(segments.iter().map(String::as_str))?;
        url.set_query(Some(&format!("$top={PAGE_SIZE}")));
        let mut items = Vec::new();
        let mut pages = client.paginated(Ok(url));
        while let Some(item) = pages.next().await {
            items.push(serde_json::from_value(item?).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))?);
        }
        Ok(items)
    }
}

#[async_trait]
impl Source for GraphDriveSource {
    fn type_label(&self) -> &'static str {
        DRIVE_LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        FILE_LABEL
    }

    fn eq_properties(&self) -> Value {
        json!([derived_eq_properties(&self.handle), self.handle.extra_str("user_account")])
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

    /// Shares the tenant's client.
    async fn open(&self, _sm: &SourceManager) -> Result<Opened> {
        Ok(Opened::new(()))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, rule: Option<&'a Rule>) -> HandleStream<'a> {
        let cutoff = rule.and_then(Rule::last_modified_cutoff);
        Box::pin(stream! {
            let client = match graph_client(sm, self.as_ref()).await {
                Ok(client) => client,
                Err(e) => { yield Err(e); return; }
            };
            let root = match self.drive_path() {
                Ok(mut segments) => { segments.push("root".into()); segments }
                Err(e) => { yield Err(e); return; }
            };
            let root: DriveItem = match client.endpoint_segments(root.iter().map(String::as_str)) {
                Ok(url) => match client.get_json(url).await {
                    Ok(root) => root,
                    Err(e) => { yield Err(e); return; }
                },
                Err(e) => { yield Err(e); return; }
            };
            // The bare root URL opens a recent-files overview instead of the folder.
            let root_link = root.web_url.map(|u| format!("{u}?view=0"));
            let source: SourceRef = self.clone();
            let mut pending = vec![(root.id, String::new(), root_link)];
            while let Some((folder_id, prefix, parent_link)) = pending.pop() {
                let children = match self.children(&client, &folder_id).await {
                    Ok(children) => children,
                    Err(e) => { yield Err(e); continue; }
                };
                for item in children {
                    let path = if prefix.is_empty() { item.name.clone() } else { format!("{prefix}/{}", item.name) };
                    if item.folder.is_some() {
                        pending.push((item.id, path, item.web_url));
                    } else if item.file.is_some() {
                        if let (Some(cutoff), Some(modified)) = (cutoff, item.modified())
                            && modified <= cutoff
                        {
                            continue;
                        }
                        yield Ok(Handle::new(source.clone(), path)
                            .with_extra("weblink", item.web_url)
                            .with_extra("parent_weblink", parent_link.clone()));
                    }
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(DriveFileResource { handle: handle.clone(), source: self.clone(), sm, metadata: OnceCell::new() })
    }

    fn guess_type(&self, handle: &Handle) -> String {
        guess_from_name(&handle.relative_path)
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        handle.name().to_string()
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        let folder = handle.relative_path.strip_suffix(handle.name()).unwrap_or_default();
        let drive = self.handle.presentation_name();
        if folder.is_empty() { drive } else { format!("{folder} (in {drive})") }
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        handle.extra_str("weblink").map(str::to_string)
    }

    fn sort_key(&self, handle: &Handle) -> String {
        format!("{}/{}", self.handle.presentation_name(), handle.relative_path)
    }
}

struct DriveFileResource<'a> {
    handle: Handle,
    source: GraphDriveSource,
    sm: &'a SourceManager,
    metadata: OnceCell<DriveItem>,
}

impl DriveFileResource<'_> {
    async fn item(&self) -> Result<&DriveItem> {
        self.metadata
            .get_or_try_init(|| async {
                let client = graph_client(self.sm, &self.source).await?;
                client.get_json(self.source.item_url(&client, &self.handle.relative_path, None)?).await
            })
            .await
    }
}

#[async_trait]
impl Resource for DriveFileResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.item().await?.size)
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self.item().await?.modified())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let client = graph_client(self.sm, &self.source).await?;
        let body = client.get_bytes(self.source.item_url(&client, &self.handle.relative_path, Some("content"))?).await?;
        Ok(cursor(body))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let item = self.item().await?;
        let mut metadata = Map::new();
        if let Some(owner) = IdentitySet::email(&item.created_by) {
            metadata.insert("msgraph-owner-account".into(), owner.into());
        }
        if let Some(editor) = IdentitySet::email(&item.last_modified_by) {
            metadata.insert("msgraph-last-modified-by".into(), editor.into());
        }
        if let Some(stamp) = &item.last_modified_date_time {
            metadata.insert("msgraph-last-modified-date-time".into(), stamp.clone().into());
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tenant() -> Arc<GraphFilesSource> {
        Arc::new(GraphFilesSource::new(GraphCredentials::new("id", "tenant", "secret"), true, true))
    }

    fn drive(user: Option<&str>, owner: Option<&str>) -> Handle {
        Handle::new(tenant(), "b!drive")
            .with_extra("folder_name", "Documents")
            .with_extra("owner_name", owner.map(str::to_string))
            .with_extra("user_account", user.map(str::to_string))
    }

    #[rstest]
    #[case(Some("eve@example.invalid"), Some("Eve"), "eve@example.invalid's files")]
    #[case(None, Some("Finance"), "\"Documents\" (owned by Finance)")]
    #[case(None, None, "\"Documents\"")]
    fn test_drive_presentation(#[case] user: Option<&str>, #[case] owner: Option<&str>, #[case] expected: &str) {
        let handle = drive(user, owner);
        assert_eq!(handle.presentation_name(), expected);
        assert_eq!(handle.presentation_place(), "Office 365");
        assert_eq!(handle.guess_type(), GRAPH_FILES_DRIVE);
    }

    #[test]
    fn test_file_presentation() {
        let source = Arc::new(GraphDriveSource::new(drive(None, Some("Finance"))));
        let nested = Handle::new(source.clone(), "Budget/2024/plan.xlsx").with_extra("weblink", "https://x.invalid/plan");
        assert_eq!(nested.presentation_name(), "plan.xlsx");
        assert_eq!(nested.presentation_place(), "Budget/2024/ (in \"Documents\" (owned by Finance))");
        assert_eq!(nested.presentation_url().as_deref(), Some("https://x.invalid/plan"));
        let top = Handle::new(source, "plan.xlsx");
        assert_eq!(top.presentation_place(), "\"Documents\" (owned by Finance)");
    }

    #[test]
    fn test_item_urls() {
        let client = GraphClient::new(reqwest::Client::new(), GraphCredentials::new("id", "tenant", "secret")).unwrap();
        let source = GraphDriveSource::new(drive(None, None));
        assert_eq!(
            source.item_url(&client, "Budget/plan 1.xlsx", Some("content")).unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/drives/b!drive/root:/Budget/plan%201.xlsx:/content"
        );
        assert_eq!(
            source.item_url(&client, "plan.xlsx", None).unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/drives/b!drive/root:/plan.xlsx"
        );

        let by_owner = GraphDriveSource::new(Handle::new(tenant(), "").with_extra("user_account", "eve@example.invalid"));
        assert_eq!(
            by_owner.item_url(&client, "a.txt", None).unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/users/eve@example.invalid/drive/root:/a.txt"
        );
    }

    #[test]
    fn test_round_trip_and_censor() {
        let registry = Registry::default();
        let source = registry.source_for_mime(&drive(Some("eve@example.invalid"), None), GRAPH_FILES_DRIVE).unwrap();
        let handle = Handle::new(source, "a/b.docx").with_extra("weblink", "https://x.invalid/b");
        let decoded = registry.decode_handle(&handle.to_json()).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(decoded.extra_str("weblink"), Some("https://x.invalid/b"));
        assert_eq!(handle.censor().to_json()["source"]["handle"]["source"]["client_secret"], Value::Null);
    }

    #[test]
    fn test_drive_owner() {
        let drive: Drive = serde_json::from_value(json!({
            "id": "b!1", "name": "Documents",
            "owner": {"group": {"displayName": "Finance"}}
        }))
        .unwrap();
        assert_eq!(drive.owner_name().as_deref(), Some("Finance"));
    }
}
