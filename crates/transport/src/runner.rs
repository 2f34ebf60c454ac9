//! The consumer loop that runs one pipeline stage against the broker.

use crate::actor::Transport;
use crate::broker::Delivery;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use trawl_pipeline::messages::queues::BROADCAST;
use trawl_pipeline::messages::{Command, ScanTag, scan_tag_of};
use trawl_pipeline::{Emit, Message, Pipeline, Stage};

/// Applies a new log filter, returning why it was refused.
pub type LogLevelHook = Box<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Stop after handling this many messages.
    pub restart_after: Option<u64>,
    /// Queues to consume from, most urgent first. While the first has
    /// messages waiting, the others are not consumed from.
    pub queue_priority: Vec<String>,
    /// How often to look at the first priority queue.
    #[serde(with = "seconds")]
    pub priority_check: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self { restart_after: None, queue_priority: Vec::new(), priority_check: Duration::from_secs(5) }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Runs `stage` over messages from a [`Transport`].
///
/// Messages are handled one at a time. Each message's output is published
/// before the message is acknowledged, so a crash mid-message means the
/// message is delivered again rather than lost. Exact duplicates of a
/// recently handled message are acknowledged without being handled again.
pub struct Runner<'a> {
    stage: Stage,
    pipeline: &'a Pipeline,
    transport: Transport,
    settings: RunnerSettings,
    on_log_level: Option<LogLevelHook>,
    declared: HashSet<String>,
    aborted: VecDeque<ScanTag>,
    recent: VecDeque<blake3::Hash>,
    profiling: bool,
    /// Whether only the first priority queue is being consumed.
    focused: bool,
    handled: u64,
}

impl<'a> Runner<'a> {
    pub fn new(stage: Stage, pipeline: &'a Pipeline, transport: Transport, settings: RunnerSettings) -> Self {
        Self {
            stage,
            pipeline,
            transport,
            settings,
            on_log_level: None,
            declared: HashSet::new(),
            aborted: VecDeque::new(),
            recent: VecDeque::new(),
            profiling: false,
            focused: false,
            handled: 0,
        }
    }

    pub fn on_log_level(mut self, hook: LogLevelHook) -> Self {
        self.on_log_level = Some(hook);
        self
    }

    /// Consumes until `shutdown` completes or the restart limit is reached,
    /// then stops the transport. Returns the number of messages handled.
    #[tracing::instrument(name = "run_stage", skip_all, fields(stage = %self.stage))]
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<u64> {
        if let Err(err) = self.setup().await {
            // The transport's own failure, if it has one, says more.
            self.transport.stop().await?;
            return Err(err);
        }
        let balancing = self.settings.queue_priority.len() > 1;
        let mut ticks = tokio::time::interval(self.settings.priority_check);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        tracing::info!("consuming");

        let outcome = loop {
            if self.settings.restart_after.is_some_and(|limit| self.handled >= limit) {
                tracing::info!(handled = self.handled, "restart limit reached");
                break Ok(());
            }
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!(handled = self.handled, "shutting down");
                    break Ok(());
                }
                _ = ticks.tick(), if balancing => {
                    if let Err(err) = self.balance().await {
                        break Err(err);
                    }
                }
                delivery = self.transport.receive() => {
                    let result = match delivery {
                        Ok(delivery) => self.dispatch(delivery).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = result {
                        break Err(err);
                    }
                }
            }
        };
        let stopped = self.transport.stop().await;
        outcome?;
        stopped?;
        Ok(self.handled)
    }

    async fn setup(&mut self) -> Result<()> {
        let stage = self.stage;
        let queues = stage.reads().iter().chain(stage.writes()).map(|q| q.to_string());
        for queue in queues.chain(self.settings.queue_priority.clone()) {
            self.declare(&queue).await?;
        }
        self.transport.subscribe_broadcast().await?;
        if self.settings.queue_priority.is_empty() {
            for queue in stage.reads() {
                self.transport.consume(queue).await?;
            }
        } else {
            for queue in &self.settings.queue_priority {
                self.transport.consume(queue).await?;
            }
        }
        Ok(())
    }

    async fn declare(&mut self, queue: &str) -> Result<()> {
        if self.declared.insert(queue.to_string()) {
            self.transport.declare(queue).await?;
        }
        Ok(())
    }

    /// Consumes only from the first priority queue while it has messages
    /// waiting, and from all of them otherwise.
    async fn balance(&mut self) -> Result<()> {
        let Some((first, rest)) = self.settings.queue_priority.split_first() else {
            return Ok(());
        };
        let busy = self.transport.queue_depth(first).await? > 0;
        if busy == self.focused {
            return Ok(());
        }
        tracing::debug!(queue = %first, focused = busy, "rebalancing consumers");
        for queue in rest {
            if busy {
                self.transport.cancel(queue).await?;
            } else {
                self.transport.consume(queue).await?;
            }
        }
        self.focused = busy;
        Ok(())
    }

    async fn dispatch(&mut self, delivery: Delivery) -> Result<()> {
        if delivery.broadcast {
            self.command(&delivery.body);
            return self.transport.ack(delivery.tag).await;
        }
        let digest = blake3::hash(&delivery.body);
        if self.recent.contains(&digest) {
            tracing::debug!(queue = %delivery.queue, "acknowledging duplicate message");
            return self.transport.ack(delivery.tag).await;
        }
        let body: Value = match serde_json::from_slice(&delivery.body) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(queue = %delivery.queue, error = %err, "rejecting message that isn't JSON");
                return self.transport.reject(delivery.tag, false).await;
            }
        };
        if let Some(tag) = scan_tag_of(&body)
            && self.aborted.contains(&tag)
        {
            tracing::debug!(queue = %delivery.queue, "rejecting message from aborted scan");
            return self.transport.reject(delivery.tag, false).await;
        }

        let started = Instant::now();
        let pipeline = self.pipeline;
        let mut emitted = pipeline.handle(self.stage, &body);
        while let Some(emit) = emitted.next().await {
            self.publish(emit).await?;
        }
        self.transport.ack(delivery.tag).await?;
        remember(&mut self.recent, digest, pipeline.settings.dedup_window);
        self.handled += 1;
        if self.profiling {
            tracing::info!(queue = %delivery.queue, elapsed = ?started.elapsed(), "handled message");
        }
        Ok(())
    }

    async fn publish(&mut self, emit: Emit) -> Result<()> {
        let body = serde_json::to_vec(&emit.message.to_json()).or_raise(|| ErrorKind::Encoding(emit.queue.clone()))?;
        if let Message::Command(_) = emit.message {
            return self.transport.publish(BROADCAST, "", body, None).await;
        }
        self.declare(&emit.queue).await?;
        self.transport.publish("", &emit.queue, body, None).await
    }

    fn command(&mut self, body: &[u8]) {
        let command: Command = match serde_json::from_slice(body) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed command");
                return;
            }
        };
        if let Some(tag) = command.abort {
            tracing::info!(scan = %tag, "aborting scan");
            if !self.aborted.contains(&tag) {
                remember(&mut self.aborted, tag, self.pipeline.settings.abort_ring_size);
            }
        }
        if let Some(level) = command.log_level {
            match self.on_log_level.as_ref().map(|hook| hook(&level)) {
                Some(Ok(())) => tracing::info!(%level, "log filter changed"),
                Some(Err(reason)) => tracing::warn!(%level, %reason, "log filter refused"),
                None => tracing::debug!(%level, "log filter changes unsupported"),
            }
        }
        if let Some(profiling) = command.profiling {
            tracing::info!(profiling, "profiling toggled");
            self.profiling = profiling;
        }
    }
}

/// Appends to a ring of at most `size` entries.
fn remember<T>(ring: &mut VecDeque<T>, item: T, size: usize) {
    if size == 0 {
        return;
    }
    while ring.len() >= size {
        ring.pop_front();
    }
    ring.push_back(item);
}
