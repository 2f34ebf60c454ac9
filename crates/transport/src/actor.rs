//! The task that owns the broker connection.
//!
//! One task drives the [`Broker`]; everything else talks to it through a
//! [`Transport`] handle that sends it actions over a channel. Incoming
//! messages wait in a heap ordered by priority, broadcasts first, and the
//! best one is handed to the consumer through a channel of its own as soon as
//! that channel has room. A failure inside the task ends it, and
//! every later request through the handle fails with
//! [`ErrorKind::Stopped`]; [`Transport::stop`] returns the failure itself.

use crate::broker::{Broker, ContentEncoding, Delivery, Properties};
use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

const ACTION_CAPACITY: usize = 64;
/// Deliveries handed over but not yet taken. Anything more stays in the heap,
/// where a later, more urgent message can still overtake it.
const HANDOVER_CAPACITY: usize = 1;

type Respond<T> = oneshot::Sender<Result<T>>;

enum Action {
    Declare { queue: String, respond: Respond<()> },
    SubscribeBroadcast { respond: Respond<()> },
    Depth { queue: String, respond: Respond<u32> },
    Consume { queue: String, respond: Respond<()> },
    Cancel { queue: String, respond: Respond<()> },
    Publish { exchange: String, routing_key: String, body: Vec<u8>, priority: Option<u8> },
    Ack(u64),
    Reject { tag: u64, requeue: bool },
    /// Answered once every earlier action has been carried out.
    Sync(oneshot::Sender<()>),
    Stop,
}

/// A delivery waiting for the consumer.
struct Waiting {
    seq: u64,
    delivery: Delivery,
}

impl Waiting {
    fn key(&self) -> (bool, u8, Reverse<u64>) {
        (self.delivery.broadcast, self.delivery.priority, Reverse(self.seq))
    }
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct Incoming {
    heap: BinaryHeap<Waiting>,
    seq: u64,
}

impl Incoming {
    fn push(&mut self, delivery: Delivery) {
        self.seq += 1;
        self.heap.push(Waiting { seq: self.seq, delivery });
    }

    fn pop(&mut self) -> Option<Delivery> {
        self.heap.pop().map(|waiting| waiting.delivery)
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Handle to the task that owns the broker connection.
#[derive(Debug)]
pub struct Transport {
    actions: mpsc::Sender<Action>,
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    task: JoinHandle<Result<()>>,
}

impl Transport {
    /// Starts the task. Published bodies are encoded with `encoding`;
    /// received bodies are decoded according to their own headers.
    pub fn spawn<B: Broker>(broker: B, encoding: ContentEncoding) -> Self {
        let (actions, receiver) = mpsc::channel(ACTION_CAPACITY);
        let (handover, deliveries) = mpsc::channel(HANDOVER_CAPACITY);
        let task = tokio::spawn(run(broker, receiver, handover, encoding));
        Self { actions, deliveries: Mutex::new(deliveries), task }
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.actions.send(action).await.map_err(|_| exn::Exn::from(ErrorKind::Stopped))
    }

    async fn request<T>(&self, make: impl FnOnce(Respond<T>) -> Action) -> Result<T> {
        let (respond, response) = oneshot::channel();
        self.send(make(respond)).await?;
        response.await.or_raise(|| ErrorKind::Stopped)?
    }

    pub async fn declare(&self, queue: &str) -> Result<()> {
        self.request(|respond| Action::Declare { queue: queue.to_string(), respond }).await
    }

    pub async fn subscribe_broadcast(&self) -> Result<()> {
        self.request(|respond| Action::SubscribeBroadcast { respond }).await
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<u32> {
        self.request(|respond| Action::Depth { queue: queue.to_string(), respond }).await
    }

    pub async fn consume(&self, queue: &str) -> Result<()> {
        self.request(|respond| Action::Consume { queue: queue.to_string(), respond }).await
    }

    pub async fn cancel(&self, queue: &str) -> Result<()> {
        self.request(|respond| Action::Cancel { queue: queue.to_string(), respond }).await
    }

    /// Queues a message for publishing. Failures surface as the task
    /// stopping.
    pub async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, priority: Option<u8>) -> Result<()> {
        let (exchange, routing_key) = (exchange.to_string(), routing_key.to_string());
        self.send(Action::Publish { exchange, routing_key, body, priority }).await
    }

    pub async fn ack(&self, tag: u64) -> Result<()> {
        self.send(Action::Ack(tag)).await
    }

    pub async fn reject(&self, tag: u64, requeue: bool) -> Result<()> {
        self.send(Action::Reject { tag, requeue }).await
    }

    /// Waits for the next message. A message stays with the transport until
    /// a wait actually returns it, so cancelling the wait doesn't lose it.
    pub async fn receive(&self) -> Result<Delivery> {
        let mut deliveries = self.deliveries.lock().await;
        deliveries.recv().await.ok_or_raise(|| ErrorKind::Stopped)
    }

    /// Waits until every action sent so far has been carried out.
    pub async fn sync(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Action::Sync(done)).await?;
        wait.await.or_raise(|| ErrorKind::Stopped)
    }

    /// Stops the task after it has carried out every earlier action, and
    /// returns the error that ended it if it had already failed.
    pub async fn stop(self) -> Result<()> {
        // A failed send means the task has already ended; its result says why.
        let _ = self.actions.send(Action::Stop).await;
        self.task.await.or_raise(|| ErrorKind::Stopped)?
    }
}

async fn run<B: Broker>(
    mut broker: B,
    mut actions: mpsc::Receiver<Action>,
    handover: mpsc::Sender<Delivery>,
    encoding: ContentEncoding,
) -> Result<()> {
    let mut incoming = Incoming::default();
    loop {
        tokio::select! {
            biased;
            action = actions.recv() => {
                let Some(action) = action else { break };
                if !act(&mut broker, action, encoding).await? {
                    break;
                }
            }
            permit = handover.reserve(), if !incoming.is_empty() => {
                // The handle is gone, and with it every consumer.
                let Ok(permit) = permit else { break };
                if let Some(delivery) = incoming.pop() {
                    permit.send(delivery);
                }
            }
            delivery = broker.next_delivery() => {
                let mut delivery = delivery?;
                match ContentEncoding::decode(delivery.content_encoding.as_deref(), std::mem::take(&mut delivery.body)) {
                    Ok(body) => {
                        delivery.body = body;
                        delivery.content_encoding = None;
                        incoming.push(delivery);
                    }
                    Err(err) => {
                        tracing::warn!(queue = %delivery.queue, error = ?err, "rejecting undecodable message");
                        broker.reject(delivery.tag, false).await?;
                    }
                }
            }
        }
    }
    tracing::debug!("transport stopping");
    broker.close().await
}

/// Carries out one action. Returns `false` when the task is to stop.
async fn act<B: Broker>(broker: &mut B, action: Action, encoding: ContentEncoding) -> Result<bool> {
    // A dropped responder means the requester stopped caring; the action
    // itself still counts.
    match action {
        Action::Declare { queue, respond } => {
            let _ = respond.send(broker.declare_queue(&queue).await);
        }
        Action::SubscribeBroadcast { respond } => {
            let _ = respond.send(broker.subscribe_broadcast().await);
        }
        Action::Depth { queue, respond } => {
            let _ = respond.send(broker.queue_depth(&queue).await);
        }
        Action::Consume { queue, respond } => {
            let _ = respond.send(broker.consume(&queue).await);
        }
        Action::Cancel { queue, respond } => {
            let _ = respond.send(broker.cancel(&queue).await);
        }
        Action::Publish { exchange, routing_key, body, priority } => {
            let (body, content_encoding) = encoding.encode(body)?;
            broker.publish(&exchange, &routing_key, body, Properties { content_encoding, priority }).await?;
        }
        Action::Ack(tag) => broker.ack(tag).await?,
        Action::Reject { tag, requeue } => broker.reject(tag, requeue).await?,
        Action::Sync(done) => {
            let _ = done.send(());
        }
        Action::Stop => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    fn delivery(tag: u64, priority: u8, broadcast: bool) -> Delivery {
        Delivery { tag, queue: "q".into(), body: Vec::new(), content_encoding: None, priority, broadcast }
    }

    #[test]
    fn test_incoming_order() {
        let mut incoming = Incoming::default();
        incoming.push(delivery(1, 0, false));
        incoming.push(delivery(2, 5, false));
        incoming.push(delivery(3, 0, false));
        incoming.push(delivery(4, 0, true));
        let order: Vec<u64> = std::iter::from_fn(|| incoming.pop()).map(|d| d.tag).collect();
        assert_eq!(order, [4, 2, 1, 3]);
        assert!(incoming.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_receive_keeps_delivery() {
        let broker = MemoryBroker::new().with_prefetch(1);
        let transport = Transport::spawn(broker.clone(), ContentEncoding::Identity);
        transport.declare("q").await.unwrap();
        transport.consume("q").await.unwrap();

        {
            let mut waiting = std::pin::pin!(transport.receive());
            assert!(futures::poll!(waiting.as_mut()).is_pending());
            broker.push_json("q", &json!({"n": 1}));
            transport.sync().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let delivery = tokio::time::timeout(Duration::from_millis(500), transport.receive()).await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&delivery.body).unwrap(), json!({"n": 1}));
        transport.ack(delivery.tag).await.unwrap();
        transport.sync().await.unwrap();
        assert_eq!(broker.acked(), [delivery.tag]);
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_through_task() {
        let broker = MemoryBroker::new();
        let transport = Transport::spawn(broker.clone(), ContentEncoding::Gzip);
        transport.declare("q").await.unwrap();
        transport.consume("q").await.unwrap();
        transport.publish("", "q", json!({"n": 1}).to_string().into_bytes(), None).await.unwrap();

        let delivery = transport.receive().await.unwrap();
        assert_eq!(delivery.queue, "q");
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&delivery.body).unwrap(), json!({"n": 1}));
        transport.ack(delivery.tag).await.unwrap();
        transport.sync().await.unwrap();

        assert_eq!(broker.acked(), [delivery.tag]);
        assert_eq!(broker.published()[0].properties.content_encoding.as_deref(), Some("gzip"));
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_ends_the_task() {
        let broker = MemoryBroker::new();
        let transport = Transport::spawn(broker, ContentEncoding::Identity);
        transport.ack(99).await.unwrap();
        let err = transport.stop().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Broker(_)));
    }
}
