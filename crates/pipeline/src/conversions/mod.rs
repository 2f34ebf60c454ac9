//! Conversions from raw objects to the representations rules evaluate.
//!
//! [`Converters`] maps an `(OutputType, MIME type)` pair to a [`Converter`].
//! Each output type may also have a wildcard converter that accepts any MIME
//! type; it's consulted only when no exact pair is registered.

mod mail;
mod text;

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use trawl_model::mime::base_type;
use trawl_model::{OutputType, Resource, read_all};

/// A hyperlink found in a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub text: Option<String>,
}

/// A converted object, ready for rule evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum Representation {
    Text(String),
    LastModified(OffsetDateTime),
    Links(Vec<Link>),
    EmailHeaders(BTreeMap<String, String>),
    /// Stands in for objects that rules can only test for existence.
    Fallback,
}

impl Representation {
    pub fn output_type(&self) -> OutputType {
        match self {
            Representation::Text(_) => OutputType::Text,
            Representation::LastModified(_) => OutputType::LastModified,
            Representation::Links(_) => OutputType::Links,
            Representation::EmailHeaders(_) => OutputType::EmailHeaders,
            Representation::Fallback => OutputType::Fallback,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Representation::Text(text) => Value::String(text.clone()),
            Representation::LastModified(at) => at.format(&Rfc3339).map(Value::String).unwrap_or(Value::Null),
            Representation::Links(links) => links.iter().map(|l| json!([l.url, l.text])).collect(),
            Representation::EmailHeaders(headers) => json!(headers),
            Representation::Fallback => Value::Bool(true),
        }
    }

    /// Decodes the JSON form of a representation of type `output`. `null`
    /// stands for an object that couldn't be converted.
    pub fn from_json(output: OutputType, value: &Value) -> Result<Option<Self>> {
        if value.is_null() {
            return Ok(None);
        }
        let malformed = || ErrorKind::Malformed(format!("bad {output} representation: {value}"));
        let representation = match output {
            OutputType::Text => Representation::Text(value.as_str().ok_or_raise(malformed)?.to_string()),
            OutputType::LastModified => {
                let text = value.as_str().ok_or_raise(malformed)?;
                Representation::LastModified(OffsetDateTime::parse(text, &Rfc3339).or_raise(malformed)?)
            }
            OutputType::Links => {
                let pairs: Vec<(String, Option<String>)> = serde_json::from_value(value.clone()).or_raise(malformed)?;
                Representation::Links(pairs.into_iter().map(|(url, text)| Link { url, text }).collect())
            }
            OutputType::EmailHeaders => {
                Representation::EmailHeaders(serde_json::from_value(value.clone()).or_raise(malformed)?)
            }
            OutputType::Fallback => Representation::Fallback,
        };
        Ok(Some(representation))
    }
}

/// The representations produced for one object, by output type. A `None`
/// entry records that a conversion was attempted and produced nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Representations(HashMap<OutputType, Option<Representation>>);

impl Representations {
    pub fn single(output: OutputType, representation: Option<Representation>) -> Self {
        Self(HashMap::from([(output, representation)]))
    }

    /// `None` if no conversion to `output` was attempted, `Some(None)` if
    /// one was and gave nothing.
    pub fn get(&self, output: OutputType) -> Option<Option<&Representation>> {
        self.0.get(&output).map(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let obj: Map<String, Value> = self
            .0
            .iter()
            .map(|(output, r)| (output.as_str().to_string(), r.as_ref().map_or(Value::Null, Representation::to_json)))
            .collect();
        Value::Object(obj)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_raise(|| ErrorKind::Malformed(format!("representations must be an object, got {value}")))?;
        let mut map = HashMap::new();
        for (key, value) in obj {
            let output: OutputType = serde_json::from_value(Value::String(key.clone()))
                .or_raise(|| ErrorKind::Malformed(format!("unknown representation type `{key}`")))?;
            map.insert(output, Representation::from_json(output, value)?);
        }
        Ok(Self(map))
    }
}

type ContentFn = fn(&[u8]) -> Result<Representation>;
type ResourceFn = for<'r> fn(&'r dyn Resource) -> BoxFuture<'r, Result<Option<Representation>>>;

/// How to produce a representation.
#[derive(Clone, Copy)]
pub enum Converter {
    /// From the object's bytes, run on a blocking thread.
    Content(ContentFn),
    /// From the live resource, for representations that only need metadata.
    Resource(ResourceFn),
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Converter::Content(_) => "Converter::Content",
            Converter::Resource(_) => "Converter::Resource",
        })
    }
}

#[derive(Debug)]
pub struct Converters {
    table: HashMap<(OutputType, Option<&'static str>), Converter>,
}

impl Default for Converters {
    /// Every built-in conversion.
    fn default() -> Self {
        let mut converters = Converters::empty();
        text::register(&mut converters);
        mail::register(&mut converters);
        converters.register(OutputType::LastModified, None, Converter::Resource(last_modified));
        converters.register(OutputType::Fallback, None, Converter::Resource(fallback));
        converters
    }
}

impl Converters {
    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    /// Registers `converter` for `mime`, or for any MIME type if `mime` is
    /// `None`.
    pub fn register(&mut self, output: OutputType, mime: Option<&'static str>, converter: Converter) -> &mut Self {
        if self.table.insert((output, mime), converter).is_some() {
            tracing::warn!(%output, ?mime, "replacing converter");
        }
        self
    }

    pub fn find(&self, output: OutputType, mime: &str) -> Option<Converter> {
        let mime = base_type(mime);
        self.table
            .iter()
            .find(|((o, m), _)| *o == output && *m == Some(mime.as_str()))
            .or_else(|| self.table.get_key_value(&(output, None)))
            .map(|(_, converter)| *converter)
    }

    pub fn exists(&self, output: OutputType, mime: &str) -> bool {
        self.find(output, mime).is_some()
    }

    /// Converts `resource`, whose content is of type `mime`, to `output`.
    pub async fn convert(&self, resource: &dyn Resource, output: OutputType, mime: &str) -> Result<Option<Representation>> {
        let converter = self
            .find(output, mime)
            .ok_or_raise(|| ErrorKind::NoConverter { output, mime: mime.to_string() })?;
        match converter {
            Converter::Resource(convert) => convert(resource).await,
            Converter::Content(convert) => {
                let reader = resource.stream().await.map_err(ErrorKind::model)?;
                let content = read_all(reader).await.map_err(ErrorKind::model)?;
                let representation = tokio::task::spawn_blocking(move || convert(&content))
                    .await
                    .or_raise(|| ErrorKind::Conversion(output))??;
                Ok(Some(representation))
            }
        }
    }
}

fn last_modified(resource: &dyn Resource) -> BoxFuture<'_, Result<Option<Representation>>> {
    Box::pin(async move {
        let at = resource.last_modified().await.map_err(ErrorKind::model)?;
        Ok(at.map(Representation::LastModified))
    })
}

fn fallback(_: &dyn Resource) -> BoxFuture<'_, Result<Option<Representation>>> {
    Box::pin(async { Ok(Some(Representation::Fallback)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use time::macros::datetime;
    use trawl_model::backend::memory::{MemoryFile, MemorySource};
    use trawl_model::{Handle, SourceManager};

    #[rstest]
    #[case(OutputType::Text, "text/plain", true)]
    #[case(OutputType::Text, "text/html; charset=utf-8", true)]
    #[case(OutputType::Text, "image/png", false)]
    #[case(OutputType::Links, "text/html", true)]
    #[case(OutputType::Links, "text/plain", false)]
    #[case(OutputType::LastModified, "image/png", true)]
    #[case(OutputType::EmailHeaders, "message/rfc822", true)]
    #[case(OutputType::Fallback, "application/x-anything", true)]
    fn test_exists(#[case] output: OutputType, #[case] mime: &str, #[case] expected: bool) {
        assert_eq!(Converters::default().exists(output, mime), expected);
    }

    #[rstest]
    #[case(Representation::Text("hi".into()))]
    #[case(Representation::LastModified(datetime!(2024-05-06 7:08:09 UTC)))]
    #[case(Representation::Links(vec![Link { url: "https://example.invalid/".into(), text: Some("home".into()) }]))]
    #[case(Representation::EmailHeaders(BTreeMap::from([("subject".into(), "hello".into())])))]
    fn test_representation_json(#[case] representation: Representation) {
        let output = representation.output_type();
        let decoded = Representation::from_json(output, &representation.to_json()).unwrap();
        assert_eq!(decoded, Some(representation));
    }

    #[test]
    fn test_representations_json() {
        let reps = Representations::single(OutputType::Text, None);
        assert_eq!(reps.to_json(), json!({"text": null}));
        let again = Representations::from_json(&reps.to_json()).unwrap();
        assert_eq!(again.get(OutputType::Text), Some(None));
        assert_eq!(again.get(OutputType::Links), None);
        assert!(Representations::from_json(&json!({"colour": 1})).is_err());
    }

    #[tokio::test]
    async fn test_convert_resource() {
        let sm = SourceManager::default();
        let source = Arc::new(
            MemorySource::new("docs")
                .with_text("a.txt", "alpha beta")
                .with_file("b.bin", MemoryFile::new(vec![0, 159, 146, 150]).modified(datetime!(2024-01-01 0:00 UTC))),
        );
        let converters = Converters::default();

        let text = Handle::new(source.clone(), "a.txt");
        let resource = text.follow(&sm);
        let rep = converters.convert(resource.as_ref(), OutputType::Text, "text/plain").await.unwrap();
        assert_eq!(rep, Some(Representation::Text("alpha beta".into())));

        let binary = Handle::new(source, "b.bin");
        let resource = binary.follow(&sm);
        let rep = converters.convert(resource.as_ref(), OutputType::LastModified, "application/octet-stream").await;
        assert_eq!(rep.unwrap(), Some(Representation::LastModified(datetime!(2024-01-01 0:00 UTC))));
        let err = converters.convert(resource.as_ref(), OutputType::Text, "application/octet-stream").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoConverter { .. }));
    }
}
