use crate::error::ErrorKind;
use crate::messages::{Emit, HandleMessage, MetadataMessage, Problem, queues};
use crate::stage::{Pipeline, Stage, undecodable};
use async_stream::stream;
use futures::stream::BoxStream;
use serde_json::Value;

pub fn handle<'a>(p: &'a Pipeline, body: &'a Value) -> BoxStream<'a, Emit> {
    match HandleMessage::decode(body, &p.registry) {
        Ok(message) => tag(p, message),
        Err(err) => undecodable(Stage::Tagger, body, &err),
    }
}

/// Extracts the backend metadata of a matching object.
pub fn tag(p: &Pipeline, message: HandleMessage) -> BoxStream<'_, Emit> {
    Box::pin(stream! {
        let HandleMessage { scan_tag, handle } = message;
        let resource = handle.follow(&p.sm);
        let metadata = p.retrier().run(|| async { resource.metadata().await.map_err(ErrorKind::model) }).await;
        drop(resource);
        match metadata {
            Ok(metadata) => yield Emit::new(queues::METADATA, MetadataMessage { scan_tag, handle, metadata }),
            Err(err) => {
                tracing::warn!(%handle, error = ?err, "metadata extraction failed");
                let text = format!("Metadata error. {}: {}", err.name(), &*err);
                yield Emit::new(queues::PROBLEMS, Problem::new(scan_tag, text).with_handle(handle));
            }
        }
    })
}
