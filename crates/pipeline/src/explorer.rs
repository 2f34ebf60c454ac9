//! Turns scan specifications into conversion requests, one per object.

use crate::error::{Error, ErrorKind};
use crate::messages::{Conversion, Emit, Problem, Progress, ScanSpec, Status, queues};
use crate::stage::{Pipeline, Stage, undecodable};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use trawl_model::Handle;
use trawl_model::error::Result as ModelResult;

pub fn handle<'a>(p: &'a Pipeline, body: &'a Value) -> BoxStream<'a, Emit> {
    match ScanSpec::decode(body, &p.registry) {
        Ok(spec) => explore(p, spec),
        Err(err) => undecodable(Stage::Explorer, body, &err),
    }
}

/// Pulls the next handle, giving up after `budget`.
async fn next_within<S>(handles: &mut S, budget: Option<Duration>) -> ModelResult<Option<Handle>>
where
    S: Stream<Item = ModelResult<Handle>> + Unpin,
{
    let next = match budget {
        Some(budget) => tokio::time::timeout(budget, handles.next())
            .await
            .map_err(|_| exn::Exn::from(trawl_model::error::ErrorKind::Timeout(budget)))?,
        None => handles.next().await,
    };
    next.transpose()
}

fn describe(err: &Error) -> String {
    format!("Exploration error. {}: {}", err.name(), &**err)
}

/// Enumerates the objects under a scan's source.
///
/// Objects of an ordinary source become conversion requests. The objects of
/// a source that yields independent sources are themselves turned into
/// sources, each explored by a scan of its own. A status summary is always
/// emitted last, whether or not enumeration succeeded.
pub fn explore(p: &Pipeline, spec: ScanSpec) -> BoxStream<'_, Emit> {
    Box::pin(stream! {
        let mut spec = spec;
        let progress = spec.progress.take().unwrap_or_else(|| Progress::new(spec.rule.clone()));
        let independent = spec.source.yields_independent_sources();
        // Sources that enumerate accounts may legitimately sleep for a long
        // time when the backend throttles them.
        let budget = (!independent).then(|| p.op_budget());
        let rule = spec.rule.clone();

        let mut count = 0u64;
        let mut failure = None;
        let mut handles = spec.source.clone().handles(&p.sm, Some(&rule));
        loop {
            let handle = match next_within(&mut handles, budget).await {
                Ok(Some(handle)) => handle,
                Ok(None) => break,
                Err(err) => {
                    failure = Some(ErrorKind::model(err));
                    break;
                }
            };
            count += 1;
            if !independent {
                let conversion = Conversion { scan_spec: spec.clone(), handle, progress: progress.clone() };
                yield Emit::new(&spec.conversion_queue, conversion);
                continue;
            }
            match p.registry.from_handle(&handle, None).await {
                Ok(Some(source)) => {
                    yield Emit::new(&spec.explorer_queue, spec.with_source(source, None));
                }
                Ok(None) => {
                    tracing::warn!(%handle, "no source for an independent object");
                    let text = format!("Exploration error. Don't know how to explore {handle}");
                    yield Emit::new(queues::PROBLEMS, Problem::new(spec.scan_tag.clone(), text).with_handle(handle));
                }
                Err(err) => {
                    let text = describe(&ErrorKind::model(err));
                    yield Emit::new(queues::PROBLEMS, Problem::new(spec.scan_tag.clone(), text).with_handle(handle));
                }
            }
        }
        drop(handles);

        let mut status = Status::new(spec.scan_tag.clone());
        status.total_objects = Some(count);
        status.new_sources = independent.then_some(count);
        match failure {
            None => tracing::info!(count, scan_tag = %spec.scan_tag, "finished exploration successfully"),
            Some(err) => {
                tracing::warn!(count, scan_tag = %spec.scan_tag, error = ?err, "finished exploration unsuccessfully");
                status.message = describe(&err);
                status.status_is_error = true;
                let problem = Problem::new(spec.scan_tag.clone(), status.message.clone()).with_source(spec.source.clone());
                yield Emit::new(queues::PROBLEMS, problem);
            }
        }
        yield Emit::new(queues::STATUS, status);
    })
}
