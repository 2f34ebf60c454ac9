//! Google Drive: one user's drive, or every shared drive of a domain.
//!
//! Handles are file ids. Native Google documents have no content of their
//! own and are exported as PDF.

use super::{GoogleClient, ServiceAccount, account_sort_prefix};
use crate::error::{ErrorKind, Result};
use crate::handle::Handle;
use crate::http::{format_rfc3339, parse_rfc3339};
use crate::manager::SourceManager;
use crate::mime::OCTET_STREAM;
use crate::registry::{Registry, str_field};
use crate::resource::{BoxSyncRead, Resource, cursor};
use crate::rule::Rule;
use crate::source::{HandleStream, Opened, Source, SourceRef};
use async_stream::stream;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

pub const DRIVE_LABEL: &str = "googledrive";
pub const SHARED_DRIVE_LABEL: &str = "googleshareddrive";
const SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const FILES: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVES: &str = "https://www.googleapis.com/drive/v3/drives";
const GOOGLE_APPS: &str = "vnd.google-apps";
const FOLDER: &str = "application/vnd.google-apps.folder";
const PDF: &str = "application/pdf";

/// A personal drive, or (`shared`) all shared drives visible to an admin.
#[derive(Clone, Debug)]
pub struct DriveSource {
    grant: Option<Value>,
    account: String,
    shared: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    mime_type: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    size: Option<String>,
    quota_bytes_used: Option<String>,
    modified_time: Option<String>,
    last_modifying_user: Option<DriveUser>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveUser {
    email_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveList {
    #[serde(default)]
    drives: Vec<SharedDrive>,
    next_page_token: Option<String>,
}

#[derive(Clone, Deserialize)]
struct SharedDrive {
    id: String,
    name: String,
}

impl DriveFile {
    fn is_native(&self) -> bool {
        self.mime_type.as_deref().is_some_and(|m| m.contains(GOOGLE_APPS))
    }
}

/// The files query: no folders, nothing in the bin, and only files changed
/// after `cutoff`.
fn files_query(cutoff: Option<OffsetDateTime>) -> String {
    let mut query = format!("mimeType != '{FOLDER}' and trashed = false");
    if let Some(cutoff) = cutoff {
        let ts = format_rfc3339(cutoff.to_offset(time::UtcOffset::UTC));
        query.push_str(&format!(" and modifiedTime > '{}'", ts.trim_end_matches('Z')));
    }
    query
}

impl DriveSource {
    pub fn personal(grant: Option<Value>, user_email: impl Into<String>) -> Self {
        Self { grant, account: user_email.into(), shared: false }
    }

    pub fn shared(grant: Option<Value>, admin_account: impl Into<String>) -> Self {
        Self { grant, account: admin_account.into(), shared: true }
    }

    fn account_key(&self) -> &'static str {
        if self.shared { "google_admin_account" } else { "user_email" }
    }

    fn decode_personal(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::personal(obj.get("google_api_grant").cloned(), str_field(obj, "user_email")?)))
    }

    fn decode_shared(obj: &Map<String, Value>, _: &Registry) -> Result<SourceRef> {
        Ok(Arc::new(Self::shared(obj.get("google_api_grant").cloned(), str_field(obj, "google_admin_account")?)))
    }

    fn shared_params(&self) -> Vec<(&'static str, String)> {
        if self.shared {
            vec![("supportsAllDrives", "true".into())]
        } else {
            Vec::new()
        }
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register_source(DRIVE_LABEL, DriveSource::decode_personal);
    registry.register_source(SHARED_DRIVE_LABEL, DriveSource::decode_shared);
}

/// Builds folder paths by walking up a file's first parent, remembering
/// every folder it has seen.
struct Locations<'c> {
    client: &'c GoogleClient,
    extra: Vec<(&'static str, String)>,
    /// Shared drive roots are all called "Drive"; use the drive's own name.
    drive_name: Option<String>,
    folders: HashMap<String, (String, Option<String>)>,
}

impl Locations<'_> {
    async fn folder(&mut self, id: &str) -> Result<(String, Option<String>)> {
        if let Some(folder) = self.folders.get(id) {
            return Ok(folder.clone());
        }
        let mut params = self.extra.clone();
        params.push(("fields", "id, name, parents".into()));
        let file: DriveFile = self.client.get_json(&format!("{FILES}/{id}"), &params).await?;
        let name = match (&self.drive_name, file.name.as_str()) {
            (Some(drive), "Drive") if file.parents.is_empty() => drive.clone(),
            _ => file.name,
        };
        let folder = (name, file.parents.into_iter().next());
        self.folders.insert(id.to_string(), folder.clone());
        Ok(folder)
    }

    async fn location(&mut self, parent: Option<&str>) -> Result<String> {
        let mut path = String::new();
        let mut next = parent.map(str::to_string);
        while let Some(id) = next {
            let (name, parent) = self.folder(&id).await?;
            path = format!("{name}/{path}");
            next = parent;
        }
        Ok(path)
    }
}

impl DriveSource {
    /// Lists the files matching `query`, in `drive` if given.
    fn list_files<'a>(
        self: &'a Arc<Self>,
        client: &'a GoogleClient,
        query: &'a str,
        drive: Option<SharedDrive>,
    ) -> HandleStream<'a> {
        Box::pin(stream! {
            let mut extra = self.shared_params();
            if let Some(drive) = &drive {
                extra.extend([
                    ("driveId", drive.id.clone()),
                    ("includeItemsFromAllDrives", "true".into()),
                    ("corpora", "drive".into()),
                ]);
            }
            let mut locations = Locations {
                client,
                extra: self.shared_params(),
                drive_name: drive.as_ref().map(|d| d.name.clone()),
                folders: HashMap::new(),
            };
            let mut page_token: Option<String> = None;
            loop {
                let mut params = extra.clone();
                params.push(("q", query.to_string()));
                params.push(("fields", "nextPageToken, files(id, name, mimeType, parents)".into()));
                params.extend(page_token.take().map(|t| ("pageToken", t)));
                let page: FileList = match client.get_json(FILES, &params).await {
                    Ok(page) => page,
                    Err(e) => { yield Err(e); return; }
                };
                for file in page.files {
                    let location = match locations.location(file.parents.first().map(String::as_str)).await {
                        Ok(location) => location,
                        Err(e) => { yield Err(e); continue; }
                    };
                    let source: SourceRef = self.clone();
                    yield Ok(Handle::new(source, file.id).with_extra("name", file.name).with_extra("location", location));
                }
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => return,
                }
            }
        })
    }
}

#[async_trait]
impl Source for DriveSource {
    fn type_label(&self) -> &'static str {
        if self.shared { SHARED_DRIVE_LABEL } else { DRIVE_LABEL }
    }

    fn eq_properties(&self) -> Value {
        json!({self.account_key(): self.account})
    }

    fn censor(&self) -> SourceRef {
        Arc::new(Self { grant: None, ..self.clone() })
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("google_api_grant".into(), self.grant.clone().unwrap_or(Value::Null));
        obj.insert(self.account_key().into(), self.account.clone().into());
        obj
    }

    async fn open(&self, sm: &SourceManager) -> Result<Opened> {
        let account = ServiceAccount::from_grant(self.grant.as_ref())?;
        Ok(Opened::new(GoogleClient::new(sm.http().client()?, account, &self.account, SCOPE)))
    }

    fn handles<'a>(self: Arc<Self>, sm: &'a SourceManager, rule: Option<&'a Rule>) -> HandleStream<'a> {
        let query = files_query(rule.and_then(Rule::last_modified_cutoff));
        Box::pin(stream! {
            let client = match sm.open_as::<GoogleClient>(self.as_ref()).await {
                Ok(client) => client,
                Err(e) => { yield Err(e); return; }
            };
            if !self.shared {
                for await handle in self.list_files(&client, &query, None) {
                    yield handle;
                }
                return;
            }
            let mut page_token: Option<String> = None;
            loop {
                let mut params = vec![
                    ("fields", "nextPageToken, drives(id, name)".to_string()),
                    ("useDomainAdminAccess", "true".to_string()),
                ];
                params.extend(page_token.take().map(|t| ("pageToken", t)));
                let page: DriveList = match client.get_json(DRIVES, &params).await {
                    Ok(page) => page,
                    Err(e) => { yield Err(e); return; }
                };
                for drive in page.drives {
                    tracing::debug!(drive = drive.name, "listing shared drive");
                    for await handle in self.list_files(&client, &query, Some(drive)) {
                        yield handle;
                    }
                }
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
        })
    }

    fn follow<'a>(&self, handle: &Handle, sm: &'a SourceManager) -> Box<dyn Resource + 'a> {
        Box::new(DriveResource { handle: handle.clone(), source: self.clone(), sm, file: OnceCell::new() })
    }

    fn presentation_name(&self, handle: &Handle) -> String {
        handle.extra_str("name").unwrap_or(&handle.relative_path).to_string()
    }

    fn presentation_place(&self, handle: &Handle) -> String {
        handle.extra_str("location").unwrap_or_default().to_string()
    }

    fn presentation_url(&self, handle: &Handle) -> Option<String> {
        Some(format!("https://drive.google.com/file/d/{}/view", handle.relative_path))
    }

    fn sort_key(&self, handle: &Handle) -> String {
        format!(
            "{}/{}/{}",
            account_sort_prefix(&self.account),
            handle.relative_path,
            handle.extra_str("name").unwrap_or_default()
        )
    }
}

struct DriveResource<'a> {
    handle: Handle,
    source: DriveSource,
    sm: &'a SourceManager,
    file: OnceCell<DriveFile>,
}

impl DriveResource<'_> {
    fn url(&self) -> String {
        format!("{FILES}/{}", self.handle.relative_path)
    }

    async fn client(&self) -> Result<Arc<GoogleClient>> {
        self.sm.open_as::<GoogleClient>(&self.source).await
    }

    async fn file(&self) -> Result<&DriveFile> {
        self.file
            .get_or_try_init(|| async {
                let client = self.client().await?;
                let mut params = self.source.shared_params();
                params.push(("fields", "name, size, quotaBytesUsed, mimeType, modifiedTime, lastModifyingUser".into()));
                client.get_json(&self.url(), &params).await
            })
            .await
    }
}

#[async_trait]
impl Resource for DriveResource<'_> {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    async fn size(&self) -> Result<u64> {
        let file = self.file().await?;
        let size = file.size.as_deref().or(file.quota_bytes_used.as_deref());
        Ok(size.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    async fn last_modified(&self) -> Result<Option<OffsetDateTime>> {
        Ok(self.file().await?.modified_time.as_deref().and_then(parse_rfc3339))
    }

    async fn compute_type(&self) -> Result<String> {
        let file = self.file().await?;
        if file.is_native() {
            return Ok(PDF.to_string());
        }
        Ok(file.mime_type.clone().unwrap_or_else(|| OCTET_STREAM.to_string()))
    }

    async fn stream(&self) -> Result<BoxSyncRead> {
        let client = self.client().await?;
        let file = self.file().await?;
        let body = if file.is_native() {
            client.get_bytes(&format!("{}/export", self.url()), &[("mimeType", PDF.to_string())]).await
        } else {
            let mut params = self.source.shared_params();
            params.push(("alt", "media".into()));
            client.get_bytes(&self.url(), &params).await
        };
        match body {
            Ok(body) => Ok(cursor(body)),
            // Exports are capped at 10 MB.
            Err(err) if matches!(&*err, ErrorKind::Http { status: 403, .. }) => {
                Err(err.raise(ErrorKind::InvalidData("document too large to export".into())))
            }
            Err(err) => Err(err),
        }
    }

    async fn metadata(&self) -> Result<Map<String, Value>> {
        let account = if self.source.shared {
            self.file().await?.last_modifying_user.as_ref().and_then(|u| u.email_address.clone())
        } else {
            Some(self.source.account.clone())
        };
        let mut metadata = Map::new();
        if let Some(account) = account {
            metadata.insert("email-account".into(), account.into());
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    #[test]
    fn test_files_query() {
        assert_eq!(files_query(None), "mimeType != 'application/vnd.google-apps.folder' and trashed = false");
        assert!(files_query(Some(datetime!(2024-02-01 12:30:00 +1))).ends_with("and modifiedTime > '2024-02-01T11:30:00'"));
    }

    #[rstest]
    #[case(DriveSource::personal(None, "alice@example.invalid"), "googledrive", "user_email")]
    #[case(DriveSource::shared(None, "admin@example.invalid"), "googleshareddrive", "google_admin_account")]
    fn test_round_trip(#[case] source: DriveSource, #[case] label: &str, #[case] key: &str) {
        let registry = Registry::default();
        let source: SourceRef = Arc::new(source);
        assert_eq!(source.type_label(), label);
        let handle = Handle::new(source, "1AbC").with_extra("name", "budget.xlsx").with_extra("location", "Finance/");
        let json = handle.to_json();
        assert!(json["source"][key].is_string());
        let decoded = registry.decode_handle(&json).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(decoded.presentation_name(), "budget.xlsx");
        assert_eq!(decoded.presentation_place(), "Finance/");
    }

    #[test]
    fn test_presentation() {
        let source: SourceRef = Arc::new(DriveSource::personal(None, "alice@example.invalid"));
        let handle = Handle::new(source, "1AbC").with_extra("name", "budget.xlsx");
        assert_eq!(handle.presentation_url().as_deref(), Some("https://drive.google.com/file/d/1AbC/view"));
        assert_eq!(handle.sort_key(), "example.invalid/alice/1AbC/budget.xlsx");
    }

    #[test]
    fn test_native_documents() {
        let doc = DriveFile { mime_type: Some("application/vnd.google-apps.document".into()), ..Default::default() };
        assert!(doc.is_native());
        let pdf = DriveFile { mime_type: Some(PDF.into()), ..Default::default() };
        assert!(!pdf.is_native());
    }

    #[tokio::test]
    async fn test_open_without_grant() {
        let source = DriveSource::personal(None, "alice@example.invalid");
        let sm = SourceManager::default();
        let err = sm.open(&source).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unauthorized(_)));
    }
}
