//! Exchange Online mailboxes.

use super::{
    GraphClient, GraphCredentials, PAGE_SIZE, account_sort_key, decode_userlist, graph_client, has_any, warn_on_error,
};
use crate::backend::mail;
use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::http::{format_rfc3339, parse_rfc3339};
use crate::manager::SourceManager;
use crate::mime::GRAPH_MAIL_ACCOUNT;
use crate::registry::{Registry, field, opt_bool};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef, derived_eq_properties, derived_to_json};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

pub const LABEL: &str = "msgraph-mail";
pub const ACCOUNT_LABEL: &str = "msgraph-mail-account";
pub const MESSAGE_LABEL: &str = "msgraph-mail-message";
/// Graph reports no size for messages.
const NOMINAL_SIZE: u64 = 1024;

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(LABEL, GraphMailSource::decode);
    registry.register_source(ACCOUNT_LABEL, GraphMailAccountSource::decode);
    registry.register_mime(GRAPH_MAIL_ACCOUNT, |h| Arc::new(GraphMailAccountSource::new(h)));
}

/// Every mailbox in a tenant, or those of a list of users. Handles are
/// accounts, each of which is scanned through a [`GraphMailAccountSource`].
#[derive(Clone, Debug)]
pub struct GraphMailSource {
    credentials: GraphCredentials,
    userlist: Option<Vec<String>>,
    scan_deleted_items_folder: bool,
    scan_syncissues_folder: bool,
    scan_attachments: bool,
}

impl GraphMailSource {
    pub fn new(credentials: GraphCredentials) -> Self {
        Self {
            credentials,
            userlist: None,
            scan_deleted_items_folder: false,
            scan_syncissues_folder: false,
            scan_attachments: true,
        }
    }

    pub fn with_userlist(mut self, users: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut users: Vec<String> = users.into_iter().map(Into::into).collect();
        users.sort();
        users.dedup();
        self.userlist = Some(users);
        self
    }

    pub fn scan_deleted_items(mut self, scan: bool) -> Self {
        self.scan_deleted_items_folder = scan;
        self
    }

    pub fn scan_sync_issues(mut self, scan: bool) -> Self {
        self.scan_syncissues_folder = scan;
        self
    }

    pub fn scan_attachments(mut self, scan: bool) -> Self {
        self.scan_attachments = scan;
        self
    }

    fn decode(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self {
            credentials: GraphCredentials::decode(obj)?,
            userlist: decode_userlist(obj),
            scan_deleted_items_folder: opt_bool(obj, "scan_deleted_items_folder", false),
            scan_syncissues_folder: opt_bool(obj, "scan_syncissues_folder", false),
            scan_attachments: opt_bool(obj, "scan_attachments", true),
        }))
    }
}

/// Whether the mailbox exists and has at least one message.
async fn has_mail(client: &GraphClient, upn: &str) -> Result<bool> {
    has_any(client, &format!("users/{upn}/messages?$select=id&$top=1")).await
}

#[async_trait]
impl Source for GraphMailSource {
    fn type_label(&self) -> &'static str {
        LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        ACCOUNT_LABEL
    }

    fn eq_properties(&self) -> Value {
        json!({
            "tenant_id": self.credentials.tenant_id,
            "client_id": self.credentials.client_id,
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
        obj.insert("userlist".into(), json!(self.userlist));
        obj.insert("scan_deleted_items_folder".into(), self.scan_deleted_items_folder.into());
        obj.insert("scan_syncissues_folder".into(), self.scan_syncissues_folder.into());
        obj.insert("scan_attachments".into(), self.scan_attachments.into());
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
                if warn_on_error("mailbox check", &upn, has_mail(&client, &upn).await) == Some(true) {
                    let source: SourceRef = self.clone();
                    yield Ok(Handle::new(source, upn));
                } else {
                    tracing::debug!(account = upn, "skipping account without mail");
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(AccountResource { handle: handle.clone(), sm })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        GRAPH_MAIL_ACCOUNT.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        handle.relative_path.clone()
    }

    fn presentation_place(&self, _handle: &Handle) -> String {
        "Office 365".into()
    }

    fn sort_key(&self, handle: &Handle) -> String {
        account_sort_key(&handle.relative_path)
    }
}

/// A mailbox as an object: it has no content of its own.
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
        has_mail(&client, &self.handle.relative_path).await
    }

    async fn size(&self) -> Result<u64> {
        Ok(0)
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(GRAPH_MAIL_ACCOUNT.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        Ok(cursor(Vec::new()))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        metadata.insert("email-account".into(), self.handle.relative_path.clone().into());
        Ok(metadata)
    }
}

/// The messages of one mailbox.
#[derive(Clone, Debug)]
pub struct GraphMailAccountSource {
    handle: Handle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Folder {
    id: String,
    display_name: String,
    #[serde(default)]
    child_folder_count: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    web_link: Option<String>,
    parent_folder_id: Option<String>,
}

impl GraphMailAccountSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    fn decode(obj: &Map<String, Value>, registry: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::new(registry.decode_handle(field(obj, "handle")?)?)))
    }

    fn upn(&self) -> &str {
        &self.handle.relative_path
    }

    /// A flag set on the mailbox-enumerating source above this one.
    fn option(&self, key: &str, default: bool) -> bool {
        opt_bool(&self.handle.source.to_json(), key, default)
    }

    /// Maps every folder id of the mailbox to its path, e.g. `Inbox/Projects`.
    async fn folder_paths(&self, client: &GraphClient) -> Result<HashMap<String, String>> {
        const SELECT: &str = "$select=id,displayName,childFolderCount&includeHiddenFolders=true";
        let upn = self.upn();
        let mut paths = HashMap::new();
        let mut pending = vec![(format!("users/{upn}/mailFolders?{SELECT}&$top={PAGE_SIZE}"), String::new())];
        while let Some((path, prefix)) = pending.pop() {
            let mut folders = client.paginated(client.endpoint(&path));
            while let Some(folder) = folders.next().await {
                let folder: Folder = serde_json::from_value(folder?)
                    .map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))?;
                let full = if prefix.is_empty() { folder.display_name } else { format!("{prefix}/{}", folder.display_name) };
                if folder.child_folder_count > 0 {
                    let children = format!("users/{upn}/mailFolders/{}/childFolders?{SELECT}&$top={PAGE_SIZE}", folder.id);
                    pending.push((children, full.clone()));
                }
                paths.insert(folder.id, full);
            }
        }
        Ok(paths)
    }

    async fn well_known_folder(&self, client: &GraphClient, name: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Id {
            id: String,
        }
        let url = client.endpoint(&format!("users/{}/mailFolders/{name}?$select=id", self.upn()))?;
        Ok(client.get_json::<Id>(url).await?.id)
    }

    /// The `$filter` clause for the message listing, if any.
    async fn message_filter(&self, client: &GraphClient, cutoff: Option<OffsetDateTime>) -> Result<Option<String>> {
        let mut clauses = Vec::new();
        for (option, folder) in [("scan_deleted_items_folder", "deleteditems"), ("scan_syncissues_folder", "syncissues")] {
            if !self.option(option, false) {
                match self.well_known_folder(client, folder).await {
                    Ok(id) => clauses.push(format!("parentFolderId ne '{id}'")),
                    Err(err) if err.is_missing() => {},
                    Err(err) => return Err(err),
                }
            }
        }
        if let Some(cutoff) = cutoff {
            clauses.push(format!("lastModifiedDateTime gt {}", format_rfc3339(cutoff)));
        }
        Ok((!clauses.is_empty()).then(|| clauses.join(" and ")))
    }
}

#[async_trait]
impl Source for GraphMailAccountSource {
    fn type_label(&self) -> &'static str {
        ACCOUNT_LABEL
    }

    fn handle_type_label(&self) -> &'static str {
        MESSAGE_LABEL
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

    /// Shares the tenant's client; there is nothing to open per account.
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
            let (folders, filter) = match futures::try_join!(self.folder_paths(&client), self.message_filter(&client, cutoff)) {
                Ok(prepared) => prepared,
                Err(e) => { yield Err(e); return; }
            };
            let mut query = format!("users/{}/messages?$select=id,subject,webLink,parentFolderId&$top={PAGE_SIZE}", self.upn());
            if let Some(filter) = filter {
                query.push_str(&format!("&$filter={filter}"));
            }
            let scan_attachments = self.option("scan_attachments", true);
            let source: SourceRef = self.clone();
            let mut messages = client.paginated(client.endpoint(&query));
            while let Some(message) = messages.next().await {
                let message: MessageRef = match message
                    .and_then(|m| serde_json::from_value(m).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string()))))
                {
                    Ok(message) => message,
                    Err(e) => { yield Err(e); return; }
                };
                let folder = message.parent_folder_id.as_ref().and_then(|id| folders.get(id)).cloned();
                yield Ok(Handle::new(source.clone(), message.id)
                    .with_extra("mail_subject", message.subject.unwrap_or_default())
                    .with_extra("weblink", message.web_link)
                    .with_extra("folder", folder)
                    .with_extra("scan_attachments", scan_attachments));
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(MessageResource { handle: handle.clone(), upn: self.upn().to_string(), sm, metadata: OnceCell::new() })
    }

    fn guess_type(&self, _handle: &Handle) -> String {
        mail::MIME.to_string()
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        format!("\"{}\"", handle.extra_str("mail_subject").unwrap_or_default())
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        match handle.extra_str("folder") {
            Some(folder) => format!("folder \"{folder}\" of account {}", self.upn()),
            None => format!("account {}", self.upn()),
        }
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        handle.extra_str("weblink").map(str::to_string)
    }

    fn sort_key(&self, handle: &Handle) -> String {
        format!(
            "{}{}/{}",
            account_sort_key(self.upn()),
            handle.extra_str("folder").unwrap_or_default(),
            handle.extra_str("mail_subject").unwrap_or_default()
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageMetadata {
    sent_date_time: Option<String>,
    last_modified_date_time: Option<String>,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    categories: Vec<String>,
}

struct MessageResource<'a> {
    handle: Handle,
    upn: String,
    sm: &'a SourceManager,
    metadata: OnceCell<MessageMetadata>,
}

impl MessageResource<'_> {
    fn path(&self) -> String {
        format!("users/{}/messages/{}", self.upn, self.handle.relative_path)
    }

    async fn message(&self) -> Result<&MessageMetadata> {
        self.metadata
            .get_or_try_init(|| async {
                let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
                let url = client.endpoint(&format!(
                    "{}?$select=sentDateTime,lastModifiedDateTime,isDraft,categories",
                    self.path()
                ))?;
                client.get_json(url).await
            })
            .await
    }
}

#[async_trait]
impl Resource for MessageResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn check(&self) -> Result<bool> {
        match self.message().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_missing() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(NOMINAL_SIZE)
    }

    /// Drafts have no send date.
    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        let message = self.message().await?;
        let stamp = if message.is_draft { &message.last_modified_date_time } else { &message.sent_date_time };
        Ok(stamp.as_deref().and_then(parse_rfc3339))
    }

    async fn compute_type(&self) -> Result<String> {
        Ok(mail::MIME.to_string())
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let client = graph_client(self.sm, self.handle.source.as_ref()).await?;
        let body = client.get_bytes(client.endpoint(&format!("{}/$value", self.path()))?).await?;
        Ok(cursor(body))
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let mut metadata = Map::new();
        metadata.insert("email-account".into(), self.upn.clone().into());
        let categories = self.message().await.map(|m| m.categories.clone()).unwrap_or_default();
        if !categories.is_empty() {
            metadata.insert("outlook-categories".into(), json!(categories));
        }
        Ok(metadata)
    }
}
