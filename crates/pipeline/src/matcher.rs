//! Evaluates rules against representations.

use crate::matching::evaluate;
use crate::messages::{Conversion, Emit, HandleMessage, MatchFragment, MatchesMessage, Problem, Progress, RepresentationMessage, queues};
use crate::stage::{Pipeline, Stage, undecodable};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

pub fn handle<'a>(p: &'a Pipeline, body: &'a Value) -> BoxStream<'a, Emit> {
    match RepresentationMessage::decode(body, &p.registry) {
        Ok(message) => stream::iter(match_representation(message)).boxed(),
        Err(err) => undecodable(Stage::Matcher, body, &err),
    }
}

/// Evaluates as much of the remaining rule as the message's representations
/// allow.
///
/// A decided rule gives the final verdict, sent to the report system and as
/// a checkup; matching objects also go on to have their metadata extracted.
/// Otherwise the object goes back for the next conversion.
pub fn match_representation(message: RepresentationMessage) -> Vec<Emit> {
    let RepresentationMessage { scan_spec, handle, progress, representations } = message;
    let mut rule = progress.rule;
    let mut matches = progress.matches;

    while let Some((head, positive, negative)) = rule.split() {
        let Some(representation) = representations.get(head.operates_on()) else {
            break;
        };
        let found = match evaluate(&head, representation) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(%handle, error = ?err, "rule evaluation failed");
                let text = format!("Matching error. {}: {}", err.name(), &*err);
                return vec![Emit::new(queues::PROBLEMS, Problem::new(scan_spec.scan_tag, text).with_handle(handle))];
            }
        };
        let fragment = MatchFragment::new(&head, found);
        rule = if fragment.matched() { positive } else { negative };
        matches.push(fragment);
    }

    let Some(matched) = rule.decided() else {
        let conversion_queue = scan_spec.conversion_queue.clone();
        let conversion = Conversion { scan_spec, handle, progress: Progress { rule, matches } };
        return vec![Emit::new(conversion_queue, conversion)];
    };

    tracing::debug!(%handle, matched, "rule decided");
    let mut emits = Vec::with_capacity(3);
    if matched {
        let message = HandleMessage { scan_tag: scan_spec.scan_tag.clone(), handle: handle.clone() };
        emits.push(Emit::new(queues::HANDLES, message));
    }
    let verdict = MatchesMessage { scan_spec, handle, matched, matches };
    emits.insert(0, Emit::new(queues::CHECKUPS, verdict.clone()));
    emits.insert(0, Emit::new(queues::MATCHES, verdict));
    emits
}
