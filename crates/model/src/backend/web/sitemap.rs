//! Sitemaps and sitemap indexes (<https://www.sitemaps.org/protocol.html>).

use crate::backend::data::unpack_data_url;
use crate::error::{ErrorKind, Result};
use crate::http::{bytes, parse_rfc3339};
use quick_xml::Reader;
use quick_xml::events::Event;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use trawl_compress::Compression;

#[derive(Clone, Debug, PartialEq)]
pub struct SitemapEntry {
    pub loc: String,
    pub last_modified: Option<OffsetDateTime>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Sitemap {
    Urls(Vec<SitemapEntry>),
    Index(Vec<String>),
}

/// `<lastmod>` is a W3C datetime, which may be a bare date.
fn parse_lastmod(value: &str) -> Option<OffsetDateTime> {
    parse_rfc3339(value).or_else(|| {
        Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
            .ok()
            .map(|d| d.midnight().assume_utc())
    })
}

pub(crate) fn parse(xml: &[u8]) -> Result<Sitemap> {
    let malformed = |detail: String| exn::Exn::from(ErrorKind::InvalidData(format!("malformed sitemap: {detail}")));
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut root: Option<Vec<u8>> = None;
    let mut current: Option<Vec<u8>> = None;
    let mut entry: Option<SitemapEntry> = None;
    let mut urls = Vec::new();
    let mut index = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| malformed(e.to_string()))? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match (root.as_deref(), name.as_slice()) {
                    (None, b"urlset" | b"sitemapindex") => root = Some(name),
                    (None, other) => exn::bail!(ErrorKind::InvalidData(format!(
                        "malformed sitemap: unexpected root element `{}`",
                        String::from_utf8_lossy(other)
                    ))),
                    (Some(_), b"url" | b"sitemap") => entry = Some(SitemapEntry { loc: String::new(), last_modified: None }),
                    (Some(_), _) => current = Some(name),
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| malformed(e.to_string()))?;
                if let (Some(field), Some(entry)) = (current.as_deref(), entry.as_mut()) {
                    match field {
                        b"loc" => entry.loc = text.trim().to_string(),
                        b"lastmod" => entry.last_modified = parse_lastmod(&text),
                        _ => {},
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"url" | b"sitemap" => {
                    if let Some(entry) = entry.take().filter(|e| !e.loc.is_empty()) {
                        match root.as_deref() {
                            Some(b"sitemapindex") => index.push(entry.loc),
                            _ => urls.push(entry),
                        }
                    }
                }
                _ => current = None,
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }
    match root.as_deref() {
        Some(b"urlset") => Ok(Sitemap::Urls(urls)),
        Some(_) => Ok(Sitemap::Index(index)),
        None => exn::bail!(ErrorKind::InvalidData("malformed sitemap: empty document".into())),
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    if url.starts_with("data:") {
        return Ok(unpack_data_url(url)?.1);
    }
    let content = bytes(client.get(url)).await?;
    // Sitemaps are often served gzipped under an XML-agnostic type.
    match Compression::sniff(&content) {
        Some(compression) => compression.decompress(&content).map_err(ErrorKind::compression),
        None => Ok(content),
    }
}

/// Fetches the sitemap at `url`, following one level of sitemap index.
/// Indexes may not refer to other indexes.
#[tracing::instrument(skip(client))]
pub(crate) async fn process_sitemap_url(client: &reqwest::Client, url: &str) -> Result<Vec<SitemapEntry>> {
    let mut entries = match parse(&fetch(client, url).await?)? {
        Sitemap::Urls(urls) => return Ok(urls),
        Sitemap::Index(children) => {
            let mut entries = Vec::new();
            for child in children {
                match parse(&fetch(client, &child).await?)? {
                    Sitemap::Urls(urls) => entries.extend(urls),
                    Sitemap::Index(_) => {
                        tracing::warn!(index = url, child, "ignoring nested sitemap index");
                    }
                }
            }
            entries
        }
    };
    entries.dedup_by(|a, b| a.loc == b.loc);
    tracing::info!(entries = entries.len(), "processed sitemap index");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use time::macros::datetime;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.invalid/</loc><lastmod>2024-05-01</lastmod></url>
  <url><loc> https://example.invalid/about?a=1&amp;b=2 </loc><lastmod>2024-05-02T10:00:00Z</lastmod></url>
  <url><lastmod>2024-05-03</lastmod></url>
  <url><loc>https://example.invalid/news</loc></url>
</urlset>"#;

    #[test]
    fn test_urlset() {
        let Sitemap::Urls(entries) = parse(URLSET.as_bytes()).unwrap() else { panic!("expected a urlset") };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].last_modified, Some(datetime!(2024-05-01 00:00:00 UTC)));
        assert_eq!(entries[1].loc, "https://example.invalid/about?a=1&b=2");
        assert_eq!(entries[1].last_modified, Some(datetime!(2024-05-02 10:00:00 UTC)));
        assert_eq!(entries[2].last_modified, None);
    }

    #[test]
    fn test_index() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
            <sitemap><loc>https://example.invalid/a.xml</loc></sitemap>
            <sitemap><loc>https://example.invalid/b.xml</loc></sitemap>
        </sitemapindex>"#;
        assert_eq!(
            parse(xml.as_bytes()).unwrap(),
            Sitemap::Index(vec!["https://example.invalid/a.xml".into(), "https://example.invalid/b.xml".into()])
        );
    }

    #[test]
    fn test_malformed() {
        assert!(parse(b"<html><body>nope</body></html>").is_err());
        assert!(parse(b"").is_err());
    }

    #[tokio::test]
    async fn test_data_url_sitemap() {
        let url = format!("data:text/xml;base64,{}", STANDARD.encode(URLSET));
        let client = reqwest::Client::new();
        let entries = process_sitemap_url(&client, &url).await.unwrap();
        assert_eq!(entries.len(), 3);
    }
}
