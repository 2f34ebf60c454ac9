//! Converts objects to the representation their remaining rule needs.

use crate::conversions::{Representation, Representations};
use crate::error::{Error, ErrorKind, Result};
use crate::messages::{ContentSkipped, Conversion, Emit, Problem, RepresentationMessage, queues};
use crate::stage::{Pipeline, Stage, undecodable};
use async_stream::stream;
use futures::stream::BoxStream;
use serde_json::Value;
use trawl_model::{Handle, OutputType, SourceRef};

pub fn handle<'a>(p: &'a Pipeline, body: &'a Value) -> BoxStream<'a, Emit> {
    match Conversion::decode(body, &p.registry) {
        Ok(conversion) => process(p, conversion, true),
        Err(err) => undecodable(Stage::Processor, body, &err),
    }
}

/// The object whose existence stands for `handle`'s: the outermost handle
/// reachable without crossing into a source that yields independent
/// sources. A mail attachment is checked through its mail, not through the
/// account the mail is in.
pub fn top_level(handle: &Handle) -> &Handle {
    let mut current = handle;
    while let Some(parent) = current.source.handle() {
        if parent.source.yields_independent_sources() {
            break;
        }
        current = parent;
    }
    current
}

/// Whether `mime` is ruled out by a skip list of MIME types and `type/*`
/// wildcards.
pub fn skipped(skip: &[&str], mime: &str) -> bool {
    skip.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => mime.starts_with(prefix),
        None => mime == *pattern,
    })
}

enum Outcome {
    Converted(Representations),
    /// The object is a container; scan it as a source of its own.
    Derived(SourceRef),
    Skipped,
}

/// Converts the object a conversion request points at.
///
/// With `check`, the object's existence is confirmed first; a missing
/// object gives one problem and one checkup, and nothing else. Requests for
/// objects outside the scan's source are dropped.
pub fn process(p: &Pipeline, conversion: Conversion, check: bool) -> BoxStream<'_, Emit> {
    Box::pin(stream! {
        let tag = conversion.scan_spec.scan_tag.clone();
        if check {
            match exists(p, &conversion.handle).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(handle = %conversion.handle, "resource missing");
                    let problem = Problem::new(tag, "Resource check failed").with_handle(conversion.handle).missing();
                    yield Emit::new(queues::PROBLEMS, problem.clone());
                    yield Emit::new(queues::CHECKUPS, problem);
                    return;
                }
                Err(err) => {
                    for emit in failed(&conversion, &err) {
                        yield emit;
                    }
                    return;
                }
            }
        }
        if !conversion.scan_spec.source.contains(&conversion.handle) {
            tracing::debug!(handle = %conversion.handle, "object is outside the scanned source, dropping");
            return;
        }

        match convert(p, &conversion).await {
            Ok(Outcome::Converted(representations)) => {
                let message = RepresentationMessage {
                    scan_spec: conversion.scan_spec,
                    handle: conversion.handle,
                    progress: conversion.progress,
                    representations,
                };
                yield Emit::new(queues::REPRESENTATIONS, message);
            }
            Ok(Outcome::Derived(source)) => {
                let spec = conversion.scan_spec.with_source(source, Some(conversion.progress));
                yield Emit::new(&conversion.scan_spec.explorer_queue, spec);
            }
            Ok(Outcome::Skipped) => {
                tracing::info!(handle = %conversion.handle, "skipping conversion due to scanner configuration");
                yield Emit::new(queues::CHECKUPS, ContentSkipped { scan_tag: tag, handle: conversion.handle });
            }
            Err(err) => {
                for emit in failed(&conversion, &err) {
                    yield emit;
                }
            }
        }
    })
}

async fn exists(p: &Pipeline, handle: &Handle) -> Result<bool> {
    let resource = top_level(handle).follow(&p.sm);
    p.retrier().run(|| async { resource.check().await.map_err(ErrorKind::model) }).await
}

async fn convert(p: &Pipeline, conversion: &Conversion) -> Result<Outcome> {
    let Some((head, _, _)) = conversion.progress.rule.split() else {
        // Nothing left to evaluate; the matcher settles it without content.
        return Ok(Outcome::Converted(Representations::default()));
    };
    let required = head.operates_on();
    let retrier = p.retrier();
    let handle = &conversion.handle;
    let resource = handle.follow(&p.sm);
    let mime = retrier.run(|| async { resource.compute_type().await.map_err(ErrorKind::model) }).await?;

    if required == OutputType::Text && skipped(&conversion.scan_spec.skip_mime_types(), &mime) {
        return Ok(Outcome::Skipped);
    }

    if p.converters.exists(required, &mime) {
        let representation = retrier.run(|| p.converters.convert(resource.as_ref(), required, &mime)).await?;
        return Ok(Outcome::Converted(Representations::single(required, representation)));
    }

    // Some objects can only be classified through their container.
    for ancestor in handle.walk_up().skip(1) {
        let resource = ancestor.follow(&p.sm);
        let mime = retrier.run(|| async { resource.compute_type().await.map_err(ErrorKind::model) }).await?;
        if p.converters.exists(required, &mime) {
            tracing::info!(%handle, rewound = %ancestor, %required, "hierarchy rewound for conversion");
            let representation = retrier.run(|| p.converters.convert(resource.as_ref(), required, &mime)).await?;
            return Ok(Outcome::Converted(Representations::single(required, representation)));
        }
    }

    match p.registry.from_handle(handle, Some(&p.sm)).await.map_err(ErrorKind::model)? {
        Some(source) => Ok(Outcome::Derived(source)),
        None => {
            tracing::debug!(%handle, %mime, %required, "no conversion or derived source, emitting empty representation");
            Ok(Outcome::Converted(Representations::single(required, None::<Representation>)))
        }
    }
}

fn failed(conversion: &Conversion, err: &Error) -> [Emit; 2] {
    let text = format!("Processing error. {}: {}", err.name(), &**err);
    tracing::warn!(handle = %conversion.handle, error = ?err, "{text}");
    let problem = Problem::new(conversion.scan_spec.scan_tag.clone(), text).with_handle(conversion.handle.clone());
    [Emit::new(queues::PROBLEMS, problem.clone()), Emit::new(queues::CHECKUPS, problem)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Progress, ScanSpec, ScanTag};
    use futures::StreamExt;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;
    use time::macros::datetime;
    use trawl_model::Rule;
    use trawl_model::backend::memory::{MemoryFile, MemorySource};

    fn conversion(source: MemorySource, path: &str, rule: Rule) -> Conversion {
        let source: SourceRef = Arc::new(source);
        let tag = ScanTag::new(datetime!(2024-01-01 0:00 UTC)).with_scanner(2, "process");
        let spec = ScanSpec::new(tag, source.clone(), rule.clone());
        Conversion { scan_spec: spec, handle: Handle::new(source, path), progress: Progress::new(rule) }
    }

    async fn run(p: &Pipeline, conversion: Conversion) -> Vec<Emit> {
        process(p, conversion, true).collect().await
    }

    #[rstest]
    #[case(&["image/*"], "image/png", true)]
    #[case(&["image/*"], "imagery/png", false)]
    #[case(&["application/pdf"], "application/pdf", true)]
    #[case(&["application/pdf"], "application/pdfx", false)]
    #[case(&[], "text/plain", false)]
    fn test_skipped(#[case] skip: &[&str], #[case] mime: &str, #[case] expected: bool) {
        assert_eq!(skipped(skip, mime), expected);
    }

    #[tokio::test]
    async fn test_missing_object_gives_one_problem_and_one_checkup() {
        let p = Pipeline::default();
        let emits = run(&p, conversion(MemorySource::new("docs"), "gone.txt", Rule::regex("x"))).await;
        assert_eq!(emits.len(), 2);
        assert_eq!(emits[0].queue, queues::PROBLEMS);
        assert_eq!(emits[1].queue, queues::CHECKUPS);
        for emit in &emits {
            let Message::Problem(problem) = &emit.message else { panic!("expected a problem") };
            assert!(problem.missing);
            assert_eq!(problem.message, "Resource check failed");
            assert_eq!(problem.handle.as_ref().map(|h| h.relative_path.as_str()), Some("gone.txt"));
        }
    }

    #[tokio::test]
    async fn test_text_conversion() {
        let p = Pipeline::default();
        let source = MemorySource::new("docs").with_text("a.txt", "hello world");
        let emits = run(&p, conversion(source, "a.txt", Rule::regex("world"))).await;
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].queue, queues::REPRESENTATIONS);
        let Message::Representation(message) = &emits[0].message else { panic!("expected a representation") };
        assert_eq!(
            message.representations.get(OutputType::Text),
            Some(Some(&Representation::Text("hello world".into())))
        );
    }

    #[tokio::test]
    async fn test_skip_list_gives_checkup() {
        let p = Pipeline::default();
        let source = MemorySource::new("docs").with_file("scan.png", MemoryFile::new(vec![0x89, b'P', b'N', b'G']).mime("image/png"));
        let mut conversion = conversion(source, "scan.png", Rule::regex("x"));
        conversion.scan_spec = conversion.scan_spec.with_configuration("skip_mime_types", json!(["image/*"]));
        let emits = run(&p, conversion).await;
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].queue, queues::CHECKUPS);
        assert!(matches!(&emits[0].message, Message::ContentSkipped(_)));
    }

    #[tokio::test]
    async fn test_container_becomes_scan_spec() {
        let p = Pipeline::default();
        let inner = MemorySource::new("inner").with_text("note.txt", "secret");
        let content = serde_json::to_vec(&inner).unwrap();
        let source = MemorySource::new("outer")
            .with_file("bundle", MemoryFile::new(content).mime(trawl_model::backend::memory::MIME));
        let emits = run(&p, conversion(source, "bundle", Rule::regex("secret"))).await;
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].queue, queues::SCAN_SPECS);
        let Message::ScanSpec(spec) = &emits[0].message else { panic!("expected a scan spec") };
        assert_eq!(spec.source.handle().map(|h| h.relative_path.as_str()), Some("bundle"));
        assert_eq!(spec.progress.as_ref().map(|p| &p.rule), Some(&Rule::regex("secret")));
    }

    #[tokio::test]
    async fn test_unconvertible_object_gives_empty_representation() {
        let p = Pipeline::default();
        let source = MemorySource::new("docs").with_file("blob", MemoryFile::new(vec![0, 1, 2]).mime("application/x-unknown"));
        let emits = run(&p, conversion(source, "blob", Rule::regex("x"))).await;
        let Message::Representation(message) = &emits[0].message else { panic!("expected a representation") };
        assert_eq!(message.representations.get(OutputType::Text), Some(None));
    }

    #[tokio::test]
    async fn test_foreign_object_is_dropped() {
        let p = Pipeline::default();
        let mut conversion = conversion(MemorySource::new("docs").with_text("a.txt", "a"), "a.txt", Rule::regex("a"));
        conversion.scan_spec.source = Arc::new(MemorySource::new("elsewhere"));
        assert!(run(&p, conversion).await.is_empty());
    }

    #[test]
    fn test_top_level_stops_at_independent_sources() {
        let registry = trawl_model::Registry::default();
        let inner = MemorySource::new("mailbox").with_text("m1.eml", "x");
        let accounts: SourceRef = Arc::new(MemorySource::new("accounts").with_nested("alice", &inner));
        let account = Handle::new(accounts, "alice");
        let mailbox = registry.source_for_mime(&account, trawl_model::backend::memory::MIME).unwrap();
        let mail = Handle::new(mailbox, "m1.eml");
        assert_eq!(top_level(&mail), &mail);

        let bundle: SourceRef = Arc::new(MemorySource::new("plain").with_text("bundle", "{}"));
        let outer = Handle::new(bundle, "bundle");
        let nested = registry.source_for_mime(&outer, trawl_model::backend::memory::MIME).unwrap();
        assert_eq!(top_level(&Handle::new(nested, "x")), &outer);
    }
}
