use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use trawl_compress::Compression;

/// One message as handed over by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Acknowledgement tag, unique per connection.
    pub tag: u64,
    /// The queue the message was consumed from. Empty for broadcasts.
    pub queue: String,
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
    pub priority: u8,
    /// Arrived through the broadcast exchange.
    pub broadcast: bool,
}

/// Per-message publishing options.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    pub content_encoding: Option<String>,
    pub priority: Option<u8>,
}

/// How message bodies are encoded on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
}

impl ContentEncoding {
    /// Encodes `body`, returning it with the `content-encoding` header to
    /// send it with.
    pub fn encode(self, body: Vec<u8>) -> Result<(Vec<u8>, Option<String>)> {
        match self {
            ContentEncoding::Identity => Ok((body, None)),
            ContentEncoding::Gzip => {
                let compressed = Compression::Gzip
                    .compress(&body)
                    .or_raise(|| ErrorKind::Encoding("gzip compression failed".into()))?;
                Ok((compressed, Some(Compression::Gzip.as_str().to_string())))
            }
        }
    }

    /// Decodes a body received with the given `content-encoding` header.
    pub fn decode(header: Option<&str>, body: Vec<u8>) -> Result<Vec<u8>> {
        match header {
            None | Some("" | "identity") => Ok(body),
            Some("gzip") => Compression::Gzip
                .decompress(&body)
                .or_raise(|| ErrorKind::Encoding("gzip decompression failed".into())),
            Some(other) => exn::bail!(ErrorKind::Encoding(format!("unsupported content encoding `{other}`"))),
        }
    }
}

/// A connection to a message broker with one channel.
///
/// Queues are durable, messages persistent. Each consumed queue has one
/// consumer; the broadcast exchange gets an anonymous queue of its own.
#[async_trait]
pub trait Broker: Send + 'static {
    async fn declare_queue(&mut self, queue: &str) -> Result<()>;

    /// Declares the broadcast exchange and starts consuming from a private
    /// queue bound to it.
    async fn subscribe_broadcast(&mut self) -> Result<()>;

    /// Number of messages ready in `queue`.
    async fn queue_depth(&mut self, queue: &str) -> Result<u32>;

    async fn consume(&mut self, queue: &str) -> Result<()>;

    async fn cancel(&mut self, queue: &str) -> Result<()>;

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: Properties) -> Result<()>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<()>;

    /// Waits for the next message from any consumer. Dropping the future
    /// before it completes must not lose a message.
    async fn next_delivery(&mut self) -> Result<Delivery>;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ContentEncoding::Identity, None)]
    #[case(ContentEncoding::Gzip, Some("gzip"))]
    fn test_encoding(#[case] encoding: ContentEncoding, #[case] header: Option<&str>) {
        let body = br#"{"scan_tag": null}"#.to_vec();
        let (encoded, sent_header) = encoding.encode(body.clone()).unwrap();
        assert_eq!(sent_header.as_deref(), header);
        assert_eq!(ContentEncoding::decode(header, encoded).unwrap(), body);
    }

    #[test]
    fn test_unknown_encoding() {
        let err = ContentEncoding::decode(Some("br"), vec![1]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Encoding(_)));
    }

    #[test]
    fn test_encoding_names() {
        let encoding: ContentEncoding = serde_json::from_str("\"gzip\"").unwrap();
        assert_eq!(encoding, ContentEncoding::Gzip);
    }
}
