//! The messages that flow between pipeline stages.
//!
//! Every message is a JSON object. Messages that carry sources or handles
//! can't be decoded by serde alone, since that needs a [`Registry`]; they
//! have `decode` constructors that take one, and `to_json` for the other
//! direction. Everything else is plain serde.

mod fragments;

pub use self::fragments::{MatchFragment, Organisation, Progress, ScanTag, Scanner};
use crate::conversions::Representations;
use crate::error::{ErrorKind, Result};
use derive_more::From;
use exn::{OptionExt, ResultExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use trawl_model::{Handle, Registry, Rule, SourceRef, source_to_json};

/// Queue and exchange names.
pub mod queues {
    pub const SCAN_SPECS: &str = "os2ds_scan_specs";
    pub const CONVERSIONS: &str = "os2ds_conversions";
    pub const REPRESENTATIONS: &str = "os2ds_representations";
    pub const HANDLES: &str = "os2ds_handles";
    pub const MATCHES: &str = "os2ds_matches";
    pub const METADATA: &str = "os2ds_metadata";
    pub const PROBLEMS: &str = "os2ds_problems";
    pub const CHECKUPS: &str = "os2ds_checkups";
    pub const STATUS: &str = "os2ds_status";
    /// Fanout exchange for command messages.
    pub const BROADCAST: &str = "broadcast";
}

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    obj.get(key).ok_or_raise(|| ErrorKind::Malformed(format!("missing key `{key}`")))
}

fn parse<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> Result<T> {
    serde_json::from_value(field(obj, key)?.clone()).or_raise(|| ErrorKind::Malformed(format!("bad `{key}`")))
}

fn as_object(value: &Value) -> Result<&Map<String, Value>> {
    value.as_object().ok_or_raise(|| ErrorKind::Malformed("message is not a JSON object".into()))
}

fn decode_source(registry: &Registry, value: &Value) -> Result<SourceRef> {
    registry.decode_source(value).map_err(ErrorKind::model)
}

fn decode_handle(registry: &Registry, value: &Value) -> Result<Handle> {
    registry.decode_handle(value).map_err(ErrorKind::model)
}

/// The scan tag of any message that has one, directly or inside its scan
/// specification.
pub fn scan_tag_of(body: &Value) -> Option<ScanTag> {
    let raw = body.get("scan_tag").or_else(|| body.get("scan_spec")?.get("scan_tag"))?;
    serde_json::from_value(raw.clone()).ok()
}

fn default_explorer_queue() -> String {
    queues::SCAN_SPECS.into()
}

fn default_conversion_queue() -> String {
    queues::CONVERSIONS.into()
}

/// A request to scan everything under a source.
#[derive(Clone, Debug)]
pub struct ScanSpec {
    pub scan_tag: ScanTag,
    pub source: SourceRef,
    pub rule: Rule,
    /// Free-form scanner settings, such as `skip_mime_types`.
    pub configuration: Map<String, Value>,
    /// Present when the source was derived from an object part-way through
    /// rule evaluation.
    pub progress: Option<Progress>,
    pub filter_rule: Option<Rule>,
    /// Where scan specifications for sources found under this one go.
    pub explorer_queue: String,
    /// Where conversion requests for objects under this source go.
    pub conversion_queue: String,
}

/// The serde-visible fields of a scan specification.
#[derive(Deserialize)]
struct ScanSpecFields {
    scan_tag: ScanTag,
    rule: Rule,
    #[serde(default)]
    configuration: Option<Map<String, Value>>,
    #[serde(default)]
    progress: Option<Progress>,
    #[serde(default)]
    filter_rule: Option<Rule>,
    #[serde(default = "default_explorer_queue")]
    explorer_queue: String,
    #[serde(default = "default_conversion_queue")]
    conversion_queue: String,
}

impl ScanSpec {
    pub fn new(scan_tag: ScanTag, source: SourceRef, rule: Rule) -> Self {
        Self {
            scan_tag,
            source,
            rule,
            configuration: Map::new(),
            progress: None,
            filter_rule: None,
            explorer_queue: default_explorer_queue(),
            conversion_queue: default_conversion_queue(),
        }
    }

    pub fn with_configuration(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// The same scan, rooted at another source.
    pub fn with_source(&self, source: SourceRef, progress: Option<Progress>) -> Self {
        Self { source, progress, ..self.clone() }
    }

    /// MIME types, or `type/*` wildcards, whose content isn't to be converted
    /// to text.
    pub fn skip_mime_types(&self) -> Vec<&str> {
        match self.configuration.get("skip_mime_types") {
            Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "scan_tag": self.scan_tag,
            "source": source_to_json(self.source.as_ref()),
            "rule": self.rule,
            "configuration": self.configuration,
            "progress": self.progress,
            "filter_rule": self.filter_rule,
            "explorer_queue": self.explorer_queue,
            "conversion_queue": self.conversion_queue,
        })
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        let fields: ScanSpecFields =
            serde_json::from_value(value.clone()).or_raise(|| ErrorKind::Malformed("bad scan specification".into()))?;
        Ok(Self {
            scan_tag: fields.scan_tag,
            source: decode_source(registry, field(obj, "source")?)?,
            rule: fields.rule,
            configuration: fields.configuration.unwrap_or_default(),
            progress: fields.progress,
            filter_rule: fields.filter_rule,
            explorer_queue: fields.explorer_queue,
            conversion_queue: fields.conversion_queue,
        })
    }
}

/// A request to convert one object to the representation its remaining rule
/// needs.
#[derive(Clone, Debug)]
pub struct Conversion {
    pub scan_spec: ScanSpec,
    pub handle: Handle,
    pub progress: Progress,
}

impl Conversion {
    pub fn to_json(&self) -> Value {
        json!({
            "scan_spec": self.scan_spec.to_json(),
            "handle": self.handle.to_json(),
            "progress": self.progress,
        })
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        Ok(Self {
            scan_spec: ScanSpec::decode(field(obj, "scan_spec")?, registry)?,
            handle: decode_handle(registry, field(obj, "handle")?)?,
            progress: parse(obj, "progress")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct RepresentationMessage {
    pub scan_spec: ScanSpec,
    pub handle: Handle,
    pub progress: Progress,
    pub representations: Representations,
}

impl RepresentationMessage {
    pub fn to_json(&self) -> Value {
        json!({
            "scan_spec": self.scan_spec.to_json(),
            "handle": self.handle.to_json(),
            "progress": self.progress,
            "representations": self.representations.to_json(),
        })
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        Ok(Self {
            scan_spec: ScanSpec::decode(field(obj, "scan_spec")?, registry)?,
            handle: decode_handle(registry, field(obj, "handle")?)?,
            progress: parse(obj, "progress")?,
            representations: Representations::from_json(field(obj, "representations")?)?,
        })
    }
}

/// An object that matched, awaiting metadata extraction.
#[derive(Clone, Debug)]
pub struct HandleMessage {
    pub scan_tag: ScanTag,
    pub handle: Handle,
}

impl HandleMessage {
    pub fn to_json(&self) -> Value {
        json!({"scan_tag": self.scan_tag, "handle": self.handle.to_json()})
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        Ok(Self { scan_tag: parse(obj, "scan_tag")?, handle: decode_handle(registry, field(obj, "handle")?)? })
    }
}

#[derive(Clone, Debug)]
pub struct MetadataMessage {
    pub scan_tag: ScanTag,
    pub handle: Handle,
    pub metadata: Map<String, Value>,
}

impl MetadataMessage {
    pub fn to_json(&self) -> Value {
        json!({"scan_tag": self.scan_tag, "handle": self.handle.to_json(), "metadata": self.metadata})
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        Ok(Self {
            scan_tag: parse(obj, "scan_tag")?,
            handle: decode_handle(registry, field(obj, "handle")?)?,
            metadata: parse(obj, "metadata")?,
        })
    }
}

/// The final verdict on one object.
#[derive(Clone, Debug)]
pub struct MatchesMessage {
    pub scan_spec: ScanSpec,
    pub handle: Handle,
    pub matched: bool,
    pub matches: Vec<MatchFragment>,
}

impl MatchesMessage {
    pub fn to_json(&self) -> Value {
        json!({
            "scan_spec": self.scan_spec.to_json(),
            "handle": self.handle.to_json(),
            "matched": self.matched,
            "matches": self.matches,
        })
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        Ok(Self {
            scan_spec: ScanSpec::decode(field(obj, "scan_spec")?, registry)?,
            handle: decode_handle(registry, field(obj, "handle")?)?,
            matched: parse(obj, "matched")?,
            matches: parse(obj, "matches")?,
        })
    }
}

/// Something went wrong with a source or an object.
#[derive(Clone, Debug)]
pub struct Problem {
    pub scan_tag: ScanTag,
    pub source: Option<SourceRef>,
    pub handle: Option<Handle>,
    pub message: String,
    /// The pipeline concluded that the object no longer exists.
    pub missing: bool,
    /// The administration system concluded that the object no longer
    /// matters.
    pub irrelevant: bool,
}

impl Problem {
    pub fn new(scan_tag: ScanTag, message: impl Into<String>) -> Self {
        Self { scan_tag, source: None, handle: None, message: message.into(), missing: false, irrelevant: false }
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn missing(mut self) -> Self {
        self.missing = true;
        self
    }

    pub fn to_json(&self) -> Value {
        json!({
            "scan_tag": self.scan_tag,
            "source": self.source.as_ref().map(|s| source_to_json(s.as_ref())),
            "handle": self.handle.as_ref().map(Handle::to_json),
            "message": self.message,
            "missing": self.missing,
            "irrelevant": self.irrelevant,
        })
    }

    pub fn decode(value: &Value, registry: &Registry) -> Result<Self> {
        let obj = as_object(value)?;
        let source = match obj.get("source") {
            None | Some(Value::Null) => None,
            Some(source) => Some(decode_source(registry, source)?),
        };
        let handle = match obj.get("handle") {
            None | Some(Value::Null) => None,
            Some(handle) => Some(decode_handle(registry, handle)?),
        };
        Ok(Self {
            scan_tag: parse(obj, "scan_tag")?,
            source,
            handle,
            message: parse(obj, "message")?,
            missing: obj.get("missing").and_then(Value::as_bool).unwrap_or(false),
            irrelevant: obj.get("irrelevant").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Progress report for the administration system. Explorers fill in the
/// object counts; workers the per-object figures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub scan_tag: ScanTag,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status_is_error: bool,
    /// Handles found during an exploration pass.
    #[serde(default)]
    pub total_objects: Option<u64>,
    /// Sources produced and enqueued during an exploration pass.
    #[serde(default)]
    pub new_sources: Option<u64>,
    #[serde(default)]
    pub object_size: Option<u64>,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub matches_found: Option<u64>,
    #[serde(default)]
    pub skipped_by_last_modified: Option<u64>,
    /// Seconds.
    #[serde(default)]
    pub process_time_worker: Option<f64>,
}

impl Status {
    pub fn new(scan_tag: ScanTag) -> Self {
        Self {
            scan_tag,
            message: String::new(),
            status_is_error: false,
            total_objects: None,
            new_sources: None,
            object_size: None,
            object_type: None,
            matches_found: None,
            skipped_by_last_modified: None,
            process_time_worker: None,
        }
    }
}

/// A conversion that the scanner's configuration ruled out.
#[derive(Clone, Debug)]
pub struct ContentSkipped {
    pub scan_tag: ScanTag,
    pub handle: Handle,
}

impl ContentSkipped {
    pub fn to_json(&self) -> Value {
        json!({"scan_tag": self.scan_tag, "handle": self.handle.to_json(), "content_skipped": true})
    }
}

/// An order from the administration system, broadcast to every stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// A scan whose remaining messages are to be dropped.
    #[serde(default)]
    pub abort: Option<ScanTag>,
    /// A new log filter, in `RUST_LOG` syntax.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Turns per-message timing logs on or off.
    #[serde(default)]
    pub profiling: Option<bool>,
}

/// Every kind of message a stage can emit.
#[derive(Clone, Debug, From)]
pub enum Message {
    ScanSpec(ScanSpec),
    Conversion(Conversion),
    Representation(RepresentationMessage),
    Handle(HandleMessage),
    Metadata(MetadataMessage),
    Matches(MatchesMessage),
    Problem(Problem),
    Status(Status),
    ContentSkipped(ContentSkipped),
    Command(Command),
}

impl Message {
    pub fn to_json(&self) -> Value {
        match self {
            Message::ScanSpec(m) => m.to_json(),
            Message::Conversion(m) => m.to_json(),
            Message::Representation(m) => m.to_json(),
            Message::Handle(m) => m.to_json(),
            Message::Metadata(m) => m.to_json(),
            Message::Matches(m) => m.to_json(),
            Message::Problem(m) => m.to_json(),
            Message::Status(m) => json!(m),
            Message::ContentSkipped(m) => m.to_json(),
            Message::Command(m) => json!(m),
        }
    }

    pub fn scan_tag(&self) -> Option<&ScanTag> {
        match self {
            Message::ScanSpec(m) => Some(&m.scan_tag),
            Message::Conversion(m) => Some(&m.scan_spec.scan_tag),
            Message::Representation(m) => Some(&m.scan_spec.scan_tag),
            Message::Handle(m) => Some(&m.scan_tag),
            Message::Metadata(m) => Some(&m.scan_tag),
            Message::Matches(m) => Some(&m.scan_spec.scan_tag),
            Message::Problem(m) => Some(&m.scan_tag),
            Message::Status(m) => Some(&m.scan_tag),
            Message::ContentSkipped(m) => Some(&m.scan_tag),
            Message::Command(_) => None,
        }
    }
}

/// A message and the queue it's bound for.
#[derive(Clone, Debug)]
pub struct Emit {
    pub queue: String,
    pub message: Message,
}

impl Emit {
    pub fn new(queue: impl Into<String>, message: impl Into<Message>) -> Self {
        Self { queue: queue.into(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::macros::datetime;
    use trawl_model::backend::memory::MemorySource;

    fn spec() -> ScanSpec {
        let source = Arc::new(MemorySource::new("docs").with_text("a.txt", "alpha"));
        ScanSpec::new(ScanTag::new(datetime!(2024-01-01 0:00 UTC)).with_scanner(7, "test"), source, Rule::regex("a"))
            .with_configuration("skip_mime_types", json!(["image/*", "application/pdf"]))
    }

    #[test]
    fn test_scan_spec_round_trip() {
        let registry = Registry::default();
        let spec = spec();
        let decoded = ScanSpec::decode(&spec.to_json(), &registry).unwrap();
        assert_eq!(decoded.scan_tag, spec.scan_tag);
        assert_eq!(*decoded.source, *spec.source);
        assert_eq!(decoded.rule, spec.rule);
        assert_eq!(decoded.skip_mime_types(), ["image/*", "application/pdf"]);
        assert_eq!(decoded.to_json(), spec.to_json());
    }

    #[test]
    fn test_scan_spec_queue_defaults() {
        let registry = Registry::default();
        let mut value = spec().to_json();
        let obj = value.as_object_mut().unwrap();
        obj.remove("explorer_queue");
        obj.remove("conversion_queue");
        obj.remove("configuration");
        let decoded = ScanSpec::decode(&value, &registry).unwrap();
        assert_eq!(decoded.explorer_queue, queues::SCAN_SPECS);
        assert_eq!(decoded.conversion_queue, queues::CONVERSIONS);
        assert!(decoded.configuration.is_empty());
    }

    #[test]
    fn test_unknown_source_is_reported() {
        let registry = Registry::default();
        let mut value = spec().to_json();
        value["source"] = json!({"type": "gopher"});
        let err = ScanSpec::decode(&value, &registry).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownScheme(label) if label == "gopher"));
    }

    #[test]
    fn test_conversion_round_trip() {
        let registry = Registry::default();
        let spec = spec();
        let handle = Handle::new(spec.source.clone(), "a.txt");
        let conversion = Conversion { progress: Progress::new(spec.rule.clone()), scan_spec: spec, handle };
        let decoded = Conversion::decode(&conversion.to_json(), &registry).unwrap();
        assert_eq!(decoded.handle, conversion.handle);
        assert_eq!(decoded.progress, conversion.progress);
        assert_eq!(scan_tag_of(&conversion.to_json()).as_ref(), Some(&conversion.scan_spec.scan_tag));
    }

    #[test]
    fn test_problem_round_trip() {
        let registry = Registry::default();
        let spec = spec();
        let problem = Problem::new(spec.scan_tag.clone(), "Resource check failed")
            .with_handle(Handle::new(spec.source.clone(), "gone.txt"))
            .missing();
        let decoded = Problem::decode(&problem.to_json(), &registry).unwrap();
        assert!(decoded.missing && !decoded.irrelevant);
        assert!(decoded.source.is_none());
        assert_eq!(decoded.handle, problem.handle);
        assert_eq!(scan_tag_of(&problem.to_json()), Some(spec.scan_tag));
    }

    #[test]
    fn test_command() {
        let command: Command = serde_json::from_value(json!({"log_level": "debug", "profiling": null})).unwrap();
        assert_eq!(command, Command { log_level: Some("debug".into()), ..Command::default() });
        assert_eq!(scan_tag_of(&Message::Command(command).to_json()), None);
    }
}
