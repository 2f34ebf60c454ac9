use crate::conversions::Converters;
use crate::messages::queues;
use crate::error::{Error, ErrorKind};
use crate::messages::{Emit, Problem, scan_tag_of};
use crate::{explorer, matcher, processor, tagger, worker};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use trawl_model::{Registry, SourceManager};
use trawl_retry::TimeoutRetrier;

/// Tunables shared by every stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Time budget, in seconds, for one operation against a backend,
    /// retries included.
    pub op_timeout: u64,
    pub op_tries: u32,
    /// How many sources deep derived sources may nest.
    pub max_depth: usize,
    /// How many aborted scans to remember.
    pub abort_ring_size: usize,
    /// How many recent message digests to remember for dropping duplicate
    /// deliveries.
    pub dedup_window: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { op_timeout: 60, op_tries: 3, max_depth: 16, abort_ring_size: 32, dedup_window: 128 }
    }
}

/// One of the pipeline's processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Stage {
    #[display("explorer")]
    Explorer,
    #[display("processor")]
    Processor,
    #[display("matcher")]
    Matcher,
    #[display("tagger")]
    Tagger,
    /// Processor, matcher and tagger in one, with the explorer for derived
    /// sources.
    #[display("worker")]
    Worker,
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explorer" => Ok(Stage::Explorer),
            "processor" => Ok(Stage::Processor),
            "matcher" => Ok(Stage::Matcher),
            "tagger" => Ok(Stage::Tagger),
            "worker" => Ok(Stage::Worker),
            other => Err(format!("unknown stage `{other}`")),
        }
    }
}

impl Stage {
    pub const ALL: [Stage; 5] = [Stage::Explorer, Stage::Processor, Stage::Matcher, Stage::Tagger, Stage::Worker];

    pub fn reads(&self) -> &'static [&'static str] {
        match self {
            Stage::Explorer => &[queues::SCAN_SPECS],
            Stage::Processor | Stage::Worker => &[queues::CONVERSIONS],
            Stage::Matcher => &[queues::REPRESENTATIONS],
            Stage::Tagger => &[queues::HANDLES],
        }
    }

    pub fn writes(&self) -> &'static [&'static str] {
        match self {
            Stage::Explorer => &[queues::CONVERSIONS, queues::PROBLEMS, queues::STATUS, queues::SCAN_SPECS],
            Stage::Processor => &[queues::REPRESENTATIONS, queues::PROBLEMS, queues::CHECKUPS, queues::SCAN_SPECS],
            Stage::Matcher => &[queues::HANDLES, queues::MATCHES, queues::CHECKUPS, queues::CONVERSIONS],
            Stage::Tagger => &[queues::METADATA, queues::PROBLEMS],
            Stage::Worker => &[queues::MATCHES, queues::CHECKUPS, queues::PROBLEMS, queues::METADATA, queues::STATUS],
        }
    }

    /// Explorations are long, so explorers and workers don't hog messages
    /// they aren't ready for.
    pub fn prefetch_count(&self, configured: u16) -> u16 {
        match self {
            Stage::Explorer | Stage::Worker => 1,
            _ => configured,
        }
    }
}

/// Everything a stage needs to handle a message.
#[derive(Debug)]
pub struct Pipeline {
    pub registry: Registry,
    pub converters: Converters,
    pub sm: SourceManager,
    pub settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(sm: SourceManager, settings: PipelineSettings) -> Self {
        Self {
            registry: Registry::default().with_max_depth(settings.max_depth),
            converters: Converters::default(),
            sm,
            settings,
        }
    }

    /// The policy for a single operation on a single object.
    pub fn retrier(&self) -> TimeoutRetrier {
        TimeoutRetrier::new(self.op_budget(), self.settings.op_tries)
    }

    pub fn op_budget(&self) -> Duration {
        Duration::from_secs(self.settings.op_timeout)
    }

    /// Handles one message read by `stage`, returning the messages it gives
    /// rise to. Nothing a message contains can make this fail: every error
    /// becomes a problem message.
    pub fn handle<'a>(&'a self, stage: Stage, body: &'a Value) -> BoxStream<'a, Emit> {
        match stage {
            Stage::Explorer => explorer::handle(self, body),
            Stage::Processor => processor::handle(self, body),
            Stage::Matcher => matcher::handle(self, body),
            Stage::Tagger => tagger::handle(self, body),
            Stage::Worker => worker::handle(self, body),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(SourceManager::default(), PipelineSettings::default())
    }
}

/// Reports a message that couldn't be decoded. Without a scan tag there's
/// nobody to report to, so the message is only logged.
pub(crate) fn undecodable<'a>(stage: Stage, body: &Value, err: &Error) -> BoxStream<'a, Emit> {
    tracing::warn!(%stage, error = ?err, "dropping undecodable message");
    let Some(scan_tag) = scan_tag_of(body) else {
        return stream::empty().boxed();
    };
    let text = match &**err {
        ErrorKind::UnknownScheme(label) => format!("Unknown scheme '{label}'"),
        _ => "Malformed input".to_string(),
    };
    stream::iter([Emit::new(queues::PROBLEMS, Problem::new(scan_tag, text))]).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("explorer", Stage::Explorer)]
    #[case("worker", Stage::Worker)]
    fn test_parse_stage(#[case] name: &str, #[case] stage: Stage) {
        assert_eq!(name.parse::<Stage>().unwrap(), stage);
        assert_eq!(stage.to_string(), name);
    }

    #[test]
    fn test_unknown_stage() {
        assert!("exporter".parse::<Stage>().is_err());
    }

    #[test]
    fn test_worker_keeps_internal_queues_internal() {
        for queue in [queues::SCAN_SPECS, queues::CONVERSIONS, queues::REPRESENTATIONS, queues::HANDLES] {
            assert!(!Stage::Worker.writes().contains(&queue), "worker writes to {queue}");
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings: PipelineSettings = serde_json::from_value(serde_json::json!({"op_tries": 5})).unwrap();
        assert_eq!(settings, PipelineSettings { op_tries: 5, ..PipelineSettings::default() });
        let pipeline = Pipeline::new(SourceManager::default(), settings);
        assert_eq!(pipeline.op_budget(), Duration::from_secs(60));
        assert_eq!(pipeline.registry.max_depth(), 16);
    }
}
