//! Microsoft 365 through the Microsoft Graph API.
//!
//! Most top-level Graph sources enumerate accounts (mailboxes, calendars,
//! drives, SharePoint lists) rather than objects. Each account handle has a
//! private MIME type, which the registry turns into a derived source for that
//! one account; the explorer then scans each account as a scan of its own.
//! Teams chats are the exception: a chat is scanned directly.

mod calendar;
mod files;
mod lists;
mod mail;
mod teams;

pub use self::calendar::{GraphCalendarAccountSource, GraphCalendarSource};
pub use self::files::{GraphDriveSource, GraphFilesSource};
pub use self::lists::{GraphListSource, GraphListsSource};
pub use self::mail::{GraphMailAccountSource, GraphMailSource};
pub use self::teams::GraphChatSource;
use crate::error::{ErrorKind, Result};
use crate::http::{TokenCache, TokenReply, json, send_authorized};
use crate::manager::SourceManager;
use crate::registry::{Registry, opt_str, str_field};
use crate::source::Source;
use async_stream::stream;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use url::Url;

const GRAPH: &str = "https://graph.microsoft.com/v1.0/";
const SCOPE: &str = "https://graph.microsoft.com/.default";
/// Results per page requested from list endpoints.
const PAGE_SIZE: u32 = 100;

pub(crate) fn register(registry: &mut Registry) {
    calendar::register(registry);
    files::register(registry);
    lists::register(registry);
    mail::register(registry);
    teams::register(registry);
}

/// An application registration's client credentials.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphCredentials {
    pub client_id: Option<String>,
    pub tenant_id: String,
    pub client_secret: Option<String>,
}

impl GraphCredentials {
    pub fn new(client_id: impl Into<String>, tenant_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self { client_id: Some(client_id.into()), tenant_id: tenant_id.into(), client_secret: Some(client_secret.into()) }
    }

    fn decode(obj: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            client_id: opt_str(obj, "client_id"),
            tenant_id: str_field(obj, "tenant_id")?.to_string(),
            client_secret: opt_str(obj, "client_secret"),
        })
    }

    fn censor(&self) -> Self {
        Self { client_id: None, tenant_id: self.tenant_id.clone(), client_secret: None }
    }

    fn write_json(&self, obj: &mut Map<String, Value>) {
        obj.insert("client_id".into(), self.client_id.clone().into());
        obj.insert("tenant_id".into(), self.tenant_id.clone().into());
        obj.insert("client_secret".into(), self.client_secret.clone().into());
    }
}

/// An optional list of user principal names to restrict a scan to.
fn decode_userlist(obj: &Map<String, Value>) -> Option<Vec<String>> {
    let mut users: Vec<String> = obj.get("userlist")?.as_array()?.iter().filter_map(Value::as_str).map(str::to_string).collect();
    users.sort();
    users.dedup();
    Some(users)
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Open state of a Graph source: an HTTP client holding an app-only token.
#[derive(Debug)]
pub(crate) struct GraphClient {
    http: reqwest::Client,
    credentials: GraphCredentials,
    base: Url,
    tokens: TokenCache,
}

impl GraphClient {
    pub(crate) fn new(http: reqwest::Client, credentials: GraphCredentials) -> Result<Self> {
        if credentials.client_id.is_none() || credentials.client_secret.is_none() {
            exn::bail!(ErrorKind::Unauthorized(format!("no client credentials for tenant {}", credentials.tenant_id)));
        }
        let base = Url::parse(GRAPH).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))?;
        Ok(Self { http, credentials, base, tokens: TokenCache::default() })
    }

    async fn fetch_token(&self) -> Result<TokenReply> {
        let url = format!("https://login.microsoftonline.com/{}/oauth2/v2.0/token", self.credentials.tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_deref().unwrap_or_default()),
            ("client_secret", self.credentials.client_secret.as_deref().unwrap_or_default()),
            ("scope", SCOPE),
        ];
        json(self.http.post(url).form(&form)).await
    }

    /// An endpoint below the API root, e.g. `users/{upn}/drive`.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
    }

    /// An endpoint built from raw path segments, each percent-encoded.
    pub(crate) fn endpoint_segments<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| exn::Exn::from(ErrorKind::Deserialize("API root cannot have path segments".into())))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) async fn get(&self, url: Url) -> Result<reqwest::Response> {
        send_authorized(&self.tokens, || self.fetch_token(), |token| self.http.get(url.clone()).bearer_auth(token)).await
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        self.get(url).await?.json::<T>().await.map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
    }

    pub(crate) async fn get_bytes(&self, url: Url) -> Result<Vec<u8>> {
        let body = self.get(url).await?.bytes().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
        Ok(body.to_vec())
    }

    /// Only links back into the API are followed.
    fn next_link(&self, link: &str) -> Result<Url> {
        if !link.starts_with(self.base.as_str()) {
            exn::bail!(ErrorKind::InvalidData(format!("next page link `{link}` leaves the API")));
        }
        Url::parse(link).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
    }

    /// Every element of a paged collection, following `@odata.nextLink`.
    pub(crate) fn paginated(&self, first: Result<Url>) -> BoxStream<'_, Result<Value>> {
        Box::pin(stream! {
            let mut next = match first {
                Ok(url) => Some(url),
                Err(e) => { yield Err(e); return; }
            };
            while let Some(url) = next.take() {
                let page: Page = match self.get_json(url).await {
                    Ok(page) => page,
                    Err(e) => { yield Err(e); return; }
                };
                for value in page.value {
                    yield Ok(value);
                }
                if let Some(link) = page.next_link {
                    match self.next_link(&link) {
                        Ok(url) => next = Some(url),
                        Err(e) => { yield Err(e); return; }
                    }
                }
            }
        })
    }

    /// User principal names of every user in the tenant, or of `userlist`.
    pub(crate) fn users<'a>(&'a self, userlist: Option<&'a [String]>) -> BoxStream<'a, Result<String>> {
        if let Some(users) = userlist {
            return Box::pin(futures::stream::iter(users.iter().cloned().map(Ok)));
        }
        let pages = self.paginated(self.endpoint(&format!("users?$select=userPrincipalName&$top={PAGE_SIZE}")));
        Box::pin(futures::StreamExt::filter_map(pages, |user| async move {
            match user {
                Ok(user) => user.get("userPrincipalName").and_then(Value::as_str).map(|upn| Ok(upn.to_string())),
                Err(e) => Some(Err(e)),
            }
        }))
    }
}

/// Decodes one element of a collection.
fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
}

/// Whether the collection at `path` exists and has at least one element.
async fn has_any(client: &GraphClient, path: &str) -> Result<bool> {
    match client.get_json::<Page>(client.endpoint(path)?).await {
        Ok(page) => Ok(!page.value.is_empty()),
        Err(err) if err.is_missing() => Ok(false),
        Err(err) => Err(err),
    }
}

/// The client of the top-level Graph source above `source`.
pub(crate) async fn graph_client(sm: &SourceManager, source: &dyn Source) -> Result<Arc<GraphClient>> {
    let mut source = source;
    while let Some(handle) = source.handle() {
        source = handle.source.as_ref();
    }
    sm.open_as::<GraphClient>(source).await
}

/// Logs an account-level failure and carries on with the next account.
fn warn_on_error<T>(label: &str, account: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(account, %err, "{label} failed");
            None
        }
    }
}

/// `user@domain` as `domain/user/`.
fn account_sort_key(upn: &str) -> String {
    match upn.split_once('@') {
        Some((account, domain)) => format!("{domain}/{account}/"),
        None => format!("{upn}/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GraphClient {
        GraphClient::new(reqwest::Client::new(), GraphCredentials::new("id", "tenant", "secret")).unwrap()
    }

    #[test]
    fn test_endpoints() {
        let client = client();
        assert_eq!(
            client.endpoint("users/a@example.invalid/drive").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/users/a@example.invalid/drive"
        );
        let url = client.endpoint_segments(["drives", "b!x", "root:", "My Files", "a#1.txt:", "content"]).unwrap();
        assert_eq!(url.as_str(), "https://graph.microsoft.com/v1.0/drives/b!x/root:/My%20Files/a%231.txt:/content");
    }

    #[test]
    fn test_next_link_stays_in_api() {
        let client = client();
        assert!(client.next_link("https://graph.microsoft.com/v1.0/users?$skiptoken=abc").is_ok());
        assert!(client.next_link("https://evil.invalid/v1.0/users").is_err());
    }

    #[test]
    fn test_missing_credentials() {
        let censored = GraphCredentials::new("id", "tenant", "secret").censor();
        let err = GraphClient::new(reqwest::Client::new(), censored).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unauthorized(_)));
    }

    #[test]
    fn test_userlist() {
        let obj = serde_json::json!({"userlist": ["b@x.invalid", "a@x.invalid", "b@x.invalid"]});
        assert_eq!(decode_userlist(obj.as_object().unwrap()), Some(vec!["a@x.invalid".into(), "b@x.invalid".into()]));
        assert_eq!(decode_userlist(&Map::new()), None);
    }

    #[tokio::test]
    async fn test_explicit_users_need_no_request() {
        use futures::TryStreamExt;
        let client = client();
        let list = vec!["a@x.invalid".to_string()];
        let users: Vec<_> = client.users(Some(&list)).try_collect().await.unwrap();
        assert_eq!(users, list);
    }
}
