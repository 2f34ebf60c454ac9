//! HTTP plumbing shared by the web, WebDAV and cloud API backends.

use crate::error::{ErrorKind, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::sync::Mutex;
use trawl_retry::Backoff;

/// Settings for every HTTP client a source opens.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    /// How many links deep the web crawler follows from its start page.
    pub ttl: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            ttl: 10,
            user_agent: concat!("trawl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    /// A client that follows up to `max_redirects` redirects by itself.
    pub fn client(&self) -> Result<reqwest::Client> {
        self.builder()
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects))
            .build()
            .map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))
    }

    /// A client that leaves redirects to the caller.
    pub fn manual_redirect_client(&self) -> Result<reqwest::Client> {
        self.builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))
    }

    fn builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder().timeout(self.timeout).user_agent(&self.user_agent).gzip(true)
    }
}

/// Sends a request, turning transport failures and error statuses into
/// model errors.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
    check_status(response)
}

/// Sends a request without judging its status, retrying while the server
/// answers `429 Too Many Requests`.
pub(crate) async fn send_throttled<F>(build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let throttle = Backoff::default().max_tries(6).warn_after(Some(3));
    throttle
        .run_if(
            || async {
                let response = build().send().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
                if response.status().as_u16() == 429 {
                    exn::bail!(ErrorKind::from_status(429, response.url().as_str()));
                }
                Ok(response)
            },
            |kind| matches!(kind, ErrorKind::Http { status: 429, .. }),
        )
        .await
}

pub(crate) fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    exn::bail!(ErrorKind::from_status(status.as_u16(), response.url().as_str()))
}

pub(crate) async fn json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    send(request).await?.json::<T>().await.map_err(|e| exn::Exn::from(ErrorKind::Deserialize(e.to_string())))
}

pub(crate) async fn bytes(request: reqwest::RequestBuilder) -> Result<Vec<u8>> {
    let body = send(request).await?.bytes().await.map_err(|e| exn::Exn::from(ErrorKind::from_reqwest(e)))?;
    Ok(body.to_vec())
}

const HTTP_DATE: &[BorrowedFormatItem<'static>] =
    format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT");

/// Parses an RFC 7231 `Last-Modified` style date.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    time::PrimitiveDateTime::parse(value.trim(), HTTP_DATE).ok().map(|dt| dt.assume_utc())
}

pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &time::format_description::well_known::Rfc3339).ok()
}

pub fn format_rfc3339(value: OffsetDateTime) -> String {
    value.format(&time::format_description::well_known::Rfc3339).unwrap_or_default()
}

/// The standard OAuth 2 token endpoint reply.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenReply {
    pub access_token: String,
    #[serde(default = "default_expiry")]
    pub expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

/// A cached bearer token that is fetched again shortly before it expires,
/// or when a server rejects it.
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    current: Mutex<Option<(String, Instant)>>,
}

/// Tokens are refreshed this long before the server would expire them.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

impl TokenCache {
    pub async fn get<F, Fut>(&self, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenReply>>,
    {
        let mut current = self.current.lock().await;
        if let Some((token, expires)) = current.as_ref()
            && Instant::now() + EXPIRY_MARGIN < *expires
        {
            return Ok(token.clone());
        }
        let reply = fetch().await?;
        tracing::debug!(expires_in = reply.expires_in, "fetched bearer token");
        let expires = Instant::now() + Duration::from_secs(reply.expires_in);
        *current = Some((reply.access_token.clone(), expires));
        Ok(reply.access_token)
    }

    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

/// Sends a request with a bearer token. If the server rejects a cached
/// token, a new one is fetched and the request is made once more.
pub(crate) async fn send_authorized<T, Fut, B>(tokens: &TokenCache, fetch: T, build: B) -> Result<reqwest::Response>
where
    T: Fn() -> Fut,
    Fut: Future<Output = Result<TokenReply>>,
    B: Fn(&str) -> reqwest::RequestBuilder,
{
    let token = tokens.get(&fetch).await?;
    let response = send_throttled(|| build(&token)).await?;
    if response.status().as_u16() != 401 {
        return check_status(response);
    }
    tracing::debug!(url = %response.url(), "bearer token rejected, fetching a new one");
    tokens.invalidate().await;
    let token = tokens.get(&fetch).await?;
    check_status(send_throttled(|| build(&token)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::macros::datetime;

    #[test]
    fn test_parse_http_date() {
        assert_eq!(parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT"), Some(datetime!(2015-10-21 07:28:00 UTC)));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_rfc3339() {
        let t = datetime!(2024-03-01 12:00:00 UTC);
        assert_eq!(parse_rfc3339(&format_rfc3339(t)), Some(t));
    }

    #[tokio::test]
    async fn test_token_cache() {
        let cache = TokenCache::default();
        let counter = AtomicU32::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            let n = fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, crate::error::Error>(TokenReply { access_token: format!("token-{n}"), expires_in: 3600 })
        };
        assert_eq!(cache.get(fetch).await.unwrap(), "token-0");
        assert_eq!(cache.get(fetch).await.unwrap(), "token-0");
        cache.invalidate().await;
        assert_eq!(cache.get(fetch).await.unwrap(), "token-1");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_lived_tokens_are_refetched() {
        let cache = TokenCache::default();
        let counter = AtomicU32::new(0);
        let fetches = &counter;
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, crate::error::Error>(TokenReply { access_token: "short".into(), expires_in: 10 })
        };
        cache.get(fetch).await.unwrap();
        cache.get(fetch).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
