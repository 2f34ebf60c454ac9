//! A broker that lives in process memory, for tests and single-process
//! runs.
//!
//! Clones share one set of queues, so a test keeps a clone to feed messages
//! in and to inspect what was published, acknowledged and rejected.

use crate::broker::{Broker, ContentEncoding, Delivery, Properties};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use trawl_pipeline::messages::queues::BROADCAST;

/// A message as published.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: Properties,
}

impl Published {
    /// The decoded JSON body.
    pub fn json(&self) -> Result<Value> {
        let body = ContentEncoding::decode(self.properties.content_encoding.as_deref(), self.body.clone())?;
        serde_json::from_slice(&body).map_err(|e| exn::Exn::from(ErrorKind::Encoding(e.to_string())))
    }
}

#[derive(Clone, Debug)]
struct Stored {
    body: Vec<u8>,
    properties: Properties,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Stored>>,
    /// Consumed queues, in the order consumption started.
    consuming: Vec<String>,
    broadcast: Option<VecDeque<Stored>>,
    unacked: HashMap<u64, (String, Stored)>,
    next_tag: u64,
    published: Vec<Published>,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
    /// Most unacknowledged queue deliveries at once.
    prefetch: Option<usize>,
    closed: bool,
}

impl State {
    fn take(&mut self) -> Option<Delivery> {
        let (queue, stored, broadcast) = match self.broadcast.as_mut().and_then(VecDeque::pop_front) {
            Some(stored) => (String::new(), stored, true),
            None => {
                let outstanding = self.unacked.values().filter(|(queue, _)| !queue.is_empty()).count();
                if self.prefetch.is_some_and(|limit| outstanding >= limit) {
                    return None;
                }
                let queue = self.consuming.iter().find(|q| self.queues.get(*q).is_some_and(|m| !m.is_empty()))?.clone();
                let stored = self.queues.get_mut(&queue)?.pop_front()?;
                (queue, stored, false)
            }
        };
        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(tag, (queue.clone(), stored.clone()));
        Some(Delivery {
            tag,
            queue,
            content_encoding: stored.properties.content_encoding,
            priority: stored.properties.priority.unwrap_or(0),
            body: stored.body,
            broadcast,
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds back queue deliveries while `limit` are unacknowledged.
    pub fn with_prefetch(self, limit: usize) -> Self {
        self.lock().prefetch = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a message as if another process had published it.
    pub fn push(&self, queue: &str, body: Vec<u8>, properties: Properties) {
        self.lock().queues.entry(queue.to_string()).or_default().push_back(Stored { body, properties });
        self.shared.notify.notify_one();
    }

    pub fn push_json(&self, queue: &str, body: &Value) {
        self.push(queue, body.to_string().into_bytes(), Properties::default());
    }

    /// Sends a command to every subscriber of the broadcast exchange.
    pub fn broadcast_json(&self, body: &Value) {
        let stored = Stored { body: body.to_string().into_bytes(), properties: Properties::default() };
        if let Some(queue) = self.lock().broadcast.as_mut() {
            queue.push_back(stored);
        }
        self.shared.notify.notify_one();
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Decoded bodies of the messages published to `queue`.
    pub fn published_to(&self, queue: &str) -> Vec<Value> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.routing_key == queue && p.exchange.is_empty())
            .filter_map(|p| p.json().ok())
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.lock().rejected.clone()
    }

    pub fn consuming(&self) -> Vec<String> {
        self.lock().consuming.clone()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&mut self, queue: &str) -> Result<()> {
        self.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn subscribe_broadcast(&mut self) -> Result<()> {
        self.lock().broadcast.get_or_insert_with(VecDeque::new);
        Ok(())
    }

    async fn queue_depth(&mut self, queue: &str) -> Result<u32> {
        Ok(u32::try_from(self.depth(queue)).unwrap_or(u32::MAX))
    }

    async fn consume(&mut self, queue: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.consuming.iter().any(|q| q == queue) {
            state.consuming.push(queue.to_string());
        }
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn cancel(&mut self, queue: &str) -> Result<()> {
        self.lock().consuming.retain(|q| q != queue);
        Ok(())
    }

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: Properties) -> Result<()> {
        let mut state = self.lock();
        state.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.clone(),
            properties: properties.clone(),
        });
        let stored = Stored { body, properties };
        if exchange == BROADCAST {
            if let Some(queue) = state.broadcast.as_mut() {
                queue.push_back(stored);
            }
        } else if let Some(queue) = state.queues.get_mut(routing_key) {
            queue.push_back(stored);
        }
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        let mut state = self.lock();
        if state.unacked.remove(&tag).is_none() {
            exn::bail!(ErrorKind::Broker(format!("unknown delivery tag {tag}")));
        }
        state.acked.push(tag);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let Some((queue, stored)) = state.unacked.remove(&tag) else {
            exn::bail!(ErrorKind::Broker(format!("unknown delivery tag {tag}")));
        };
        state.rejected.push((tag, requeue));
        if requeue && !queue.is_empty() {
            state.queues.entry(queue).or_default().push_front(stored);
        }
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    exn::bail!(ErrorKind::Stopped);
                }
                if let Some(delivery) = state.take() {
                    return Ok(delivery);
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        self.shared.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_deliveries_follow_consumption() {
        let mut broker = MemoryBroker::new();
        broker.declare_queue("a").await.unwrap();
        broker.push_json("a", &json!({"n": 1}));
        broker.push_json("b", &json!({"n": 2}));
        broker.consume("a").await.unwrap();

        let delivery = broker.next_delivery().await.unwrap();
        assert_eq!(delivery.queue, "a");
        assert!(!delivery.broadcast);
        broker.reject(delivery.tag, true).await.unwrap();
        assert_eq!(broker.depth("a"), 1);

        let again = broker.next_delivery().await.unwrap();
        assert_eq!(again.body, delivery.body);
        broker.ack(again.tag).await.unwrap();
        assert_eq!(broker.acked(), [again.tag]);
        assert_eq!(broker.depth("b"), 1);
    }

    #[tokio::test]
    async fn test_broadcasts_come_first() {
        let mut broker = MemoryBroker::new();
        broker.subscribe_broadcast().await.unwrap();
        broker.consume("a").await.unwrap();
        broker.push_json("a", &json!({"n": 1}));
        broker.publish(BROADCAST, "", b"{}".to_vec(), Properties::default()).await.unwrap();
        assert!(broker.next_delivery().await.unwrap().broadcast);
        assert!(!broker.next_delivery().await.unwrap().broadcast);
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_deliveries() {
        let mut broker = MemoryBroker::new().with_prefetch(1);
        broker.consume("a").await.unwrap();
        broker.push_json("a", &json!({"n": 1}));
        broker.push_json("a", &json!({"n": 2}));
        let first = broker.next_delivery().await.unwrap();
        assert!(broker.lock().take().is_none());
        broker.ack(first.tag).await.unwrap();
        assert!(broker.next_delivery().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_broker_stops_delivering() {
        let mut broker = MemoryBroker::new();
        broker.close().await.unwrap();
        let err = broker.next_delivery().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Stopped));
    }
}
