//! The processor, matcher and tagger run as one process.
//!
//! Messages bound for another stage are handled in place instead of going
//! through the broker; only the results for the outside world are emitted.
//! Scans of sources found inside objects are explored in place as well.

use crate::error::{ErrorKind, Result};
use crate::explorer::explore;
use crate::matcher::match_representation;
use crate::messages::{Conversion, Emit, Message, Status, queues};
use crate::processor::process;
use crate::stage::{Pipeline, Stage, undecodable};
use crate::tagger::tag;
use async_stream::stream;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use trawl_retry::TimeoutRetrier;

/// Budget for each lookup that closes every message. They should be
/// instant; running out suggests broken connection state.
const LOOKUP_BUDGET: Duration = Duration::from_secs(10);
const LOOKUP_TRIES: u32 = 3;
/// Reported when the object's type can't be worked out.
const UNKNOWN_TYPE: &str = "application/octet-stream";

pub fn handle<'a>(p: &'a Pipeline, body: &'a Value) -> BoxStream<'a, Emit> {
    match Conversion::decode(body, &p.registry) {
        Ok(conversion) => work(p, conversion),
        Err(err) => undecodable(Stage::Worker, body, &err),
    }
}

/// Runs a conversion request through every stage it needs, then reports the
/// object's size, the number of matching objects found and the time taken.
pub fn work(p: &Pipeline, conversion: Conversion) -> BoxStream<'_, Emit> {
    Box::pin(stream! {
        let started = Instant::now();
        let scan_tag = conversion.scan_spec.scan_tag.clone();
        let handle = conversion.handle.clone();
        let matches = AtomicU64::new(0);

        let emits = route(p, process(p, conversion, true), &matches);
        for await emit in emits {
            if Stage::Worker.writes().contains(&emit.queue.as_str()) {
                yield emit;
            } else {
                tracing::error!(queue = %emit.queue, "unexpected message to queue");
            }
        }

        let resource = handle.follow(&p.sm);
        let retrier = TimeoutRetrier::new(LOOKUP_BUDGET, LOOKUP_TRIES);
        let size = retrier.run(|| async { resource.size().await.map_err(ErrorKind::model) }).await;
        let mime = retrier.run(|| async { resource.compute_type().await.map_err(ErrorKind::model) }).await;
        drop(resource);
        let (object_size, object_type, stale) = describe_object(size, mime);
        if stale {
            tracing::warn!(%handle, "object lookups took too long, clearing source manager state");
            p.sm.clear();
        }

        let mut status = Status::new(scan_tag);
        status.object_size = Some(object_size);
        status.object_type = Some(object_type);
        status.matches_found = Some(matches.load(Ordering::Relaxed));
        status.process_time_worker = Some(started.elapsed().as_secs_f64());
        yield Emit::new(queues::STATUS, status);

        // Temporary files go; connections stay open for the next object.
        p.sm.clear_dependents();
    })
}

/// Size and type for the status report, and whether either lookup timed out.
fn describe_object(size: Result<u64>, mime: Result<String>) -> (u64, String, bool) {
    let stale = size.as_ref().is_err_and(|e| e.is_timeout()) || mime.as_ref().is_err_and(|e| e.is_timeout());
    (size.unwrap_or(0), mime.unwrap_or_else(|_| UNKNOWN_TYPE.into()), stale)
}

/// Feeds each message of `upstream` to the stage that would have read it,
/// passing on only what no internal stage handles.
fn route<'a>(p: &'a Pipeline, upstream: BoxStream<'a, Emit>, matches: &'a AtomicU64) -> BoxStream<'a, Emit> {
    Box::pin(stream! {
        for await emit in upstream {
            let downstream = match emit.message {
                // Existence was established by the first conversion.
                Message::Conversion(conversion) => process(p, conversion, false),
                Message::ScanSpec(spec) => explore(p, spec),
                Message::Representation(representation) => stream::iter(match_representation(representation)).boxed(),
                Message::Handle(message) => {
                    matches.fetch_add(1, Ordering::Relaxed);
                    tag(p, message)
                }
                // Exploration summaries concern whole scans, not this object.
                Message::Status(_) => continue,
                message @ (Message::Metadata(_)
                | Message::Matches(_)
                | Message::Problem(_)
                | Message::ContentSkipped(_)
                | Message::Command(_)) => {
                    yield Emit { queue: emit.queue, message };
                    continue;
                }
            };
            for await emit in route(p, downstream, matches) {
                yield emit;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Progress, ScanSpec, ScanTag};
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;
    use time::macros::datetime;
    use trawl_model::backend::memory::{MIME, MemoryFile, MemorySource};
    use trawl_model::{Handle, Rule, SourceRef};

    fn conversion(source: MemorySource, path: &str, rule: Rule) -> Conversion {
        let source: SourceRef = Arc::new(source);
        let tag = ScanTag::new(datetime!(2024-01-01 0:00 UTC)).with_scanner(6, "work");
        let spec = ScanSpec::new(tag, source.clone(), rule.clone());
        Conversion { scan_spec: spec, handle: Handle::new(source, path), progress: Progress::new(rule) }
    }

    async fn run(p: &Pipeline, conversion: Conversion) -> Vec<Emit> {
        let emits: Vec<Emit> = work(p, conversion).collect().await;
        for emit in &emits {
            assert!(Stage::Worker.writes().contains(&emit.queue.as_str()), "leaked {}", emit.queue);
        }
        emits
    }

    fn queues_of(emits: &[Emit]) -> Vec<&str> {
        emits.iter().map(|e| e.queue.as_str()).collect()
    }

    fn status(emits: &[Emit]) -> &Status {
        match emits.last().map(|e| &e.message) {
            Some(Message::Status(status)) => status,
            other => panic!("expected a final status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matching_object() {
        let p = Pipeline::default();
        let source = MemorySource::new("docs").with_text("cpr.txt", "cpr 111111-1118");
        let emits = run(&p, conversion(source, "cpr.txt", Rule::regex(r"\d{6}-\d{4}"))).await;
        assert_eq!(queues_of(&emits), [queues::MATCHES, queues::CHECKUPS, queues::METADATA, queues::STATUS]);
        let status = status(&emits);
        assert_eq!(status.matches_found, Some(1));
        assert_eq!(status.object_size, Some(15));
        assert_eq!(status.object_type.as_deref(), Some("text/plain"));
        assert!(status.process_time_worker.is_some());
    }

    #[tokio::test]
    async fn test_missing_object() {
        let p = Pipeline::default();
        let emits = run(&p, conversion(MemorySource::new("docs"), "gone.txt", Rule::regex("x"))).await;
        assert_eq!(queues_of(&emits), [queues::PROBLEMS, queues::CHECKUPS, queues::STATUS]);
        let status = status(&emits);
        assert_eq!(status.object_size, Some(0));
        assert_eq!(status.object_type.as_deref(), Some(UNKNOWN_TYPE));
        assert_eq!(status.matches_found, Some(0));
    }

    #[rstest]
    #[case(Ok(7), Ok("text/plain"), (7, "text/plain", false))]
    #[case(Err(ErrorKind::Model("not found: x".into())), Ok("text/plain"), (0, "text/plain", false))]
    #[case(Err(ErrorKind::Timeout(LOOKUP_BUDGET)), Ok("text/plain"), (0, "text/plain", true))]
    #[case(Ok(7), Err(ErrorKind::Timeout(LOOKUP_BUDGET)), (7, UNKNOWN_TYPE, true))]
    #[case(Ok(7), Err(ErrorKind::Transient("reset".into())), (7, UNKNOWN_TYPE, false))]
    fn test_describe_object(
        #[case] size: std::result::Result<u64, ErrorKind>,
        #[case] mime: std::result::Result<&str, ErrorKind>,
        #[case] expected: (u64, &str, bool),
    ) {
        let size = size.map_err(exn::Exn::from);
        let mime = mime.map(str::to_string).map_err(exn::Exn::from);
        let (object_size, object_type, stale) = describe_object(size, mime);
        assert_eq!((object_size, object_type.as_str(), stale), expected);
    }

    #[tokio::test]
    async fn test_objects_inside_containers_are_scanned_in_place() {
        let p = Pipeline::default();
        let inner = MemorySource::new("inner").with_text("note.txt", "the secret").with_text("other.txt", "nothing");
        let content = serde_json::to_vec(&inner).unwrap();
        let source = MemorySource::new("outer").with_file("bundle", MemoryFile::new(content).mime(MIME));
        let emits = run(&p, conversion(source, "bundle", Rule::regex("secret"))).await;

        let verdicts: Vec<bool> = emits
            .iter()
            .filter(|e| e.queue == queues::MATCHES)
            .map(|e| match &e.message {
                Message::Matches(m) => m.matched,
                _ => panic!("expected matches"),
            })
            .collect();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts.iter().filter(|&&m| m).count(), 1);
        assert_eq!(emits.iter().filter(|e| e.queue == queues::STATUS).count(), 1);
        assert_eq!(status(&emits).matches_found, Some(1));
    }

    #[tokio::test]
    async fn test_skipped_content() {
        let p = Pipeline::default();
        let source = MemorySource::new("docs").with_file("photo.png", MemoryFile::new(vec![1, 2, 3]).mime("image/png"));
        let mut conversion = conversion(source, "photo.png", Rule::regex("x"));
        conversion.scan_spec = conversion.scan_spec.with_configuration("skip_mime_types", json!(["image/*"]));
        let emits = run(&p, conversion).await;
        assert_eq!(queues_of(&emits), [queues::CHECKUPS, queues::STATUS]);
        assert!(matches!(emits[0].message, Message::ContentSkipped(_)));
    }

    #[tokio::test]
    async fn test_multi_step_rule() {
        let p = Pipeline::default();
        let source = MemorySource::new("docs").with_file(
            "old.txt",
            MemoryFile::new("needle".as_bytes()).modified(datetime!(2023-01-01 0:00 UTC)),
        );
        let rule = Rule::and(vec![Rule::regex("needle"), Rule::last_modified(datetime!(2024-01-01 0:00 UTC))]);
        let emits = run(&p, conversion(source, "old.txt", rule)).await;
        assert_eq!(queues_of(&emits), [queues::MATCHES, queues::CHECKUPS, queues::STATUS]);
        let Message::Matches(verdict) = &emits[0].message else { panic!("expected matches") };
        assert!(!verdict.matched);
        assert_eq!(verdict.matches.len(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_message() {
        let p = Pipeline::default();
        let emits: Vec<Emit> = handle(&p, &json!({"scan_spec": {"scan_tag": "nope"}})).collect().await;
        assert!(emits.is_empty());
    }
}
