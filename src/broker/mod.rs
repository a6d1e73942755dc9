//! The message broker interface stages communicate through.
//!
//! Delivery is at-least-once: a delivery which is neither acked nor nacked before it is dropped
//! goes back to its queue flagged as redelivered.

mod memory;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::memory::MemoryBroker;

/// The routing behavior of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Every bound queue receives every message.
    Fanout,
    /// Bound queues receive the messages whose routing key equals their binding key.
    Topic,
}

/// The target of a publication.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue(String),
    Exchange { name: String, routing_key: String },
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "queue {}", name),
            Self::Exchange { name, routing_key } => write!(f, "exchange {} with key {:?}", name, routing_key),
        }
    }
}

/// A message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declare a queue, a no-op if it already exists.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Declare an exchange, a no-op if it already exists with the same kind.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Bind a queue to an exchange with the given binding key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message, waiting for space in the destination queues.
    ///
    /// Persistent messages must survive a restart of the broker; transient ones may be lost.
    async fn publish(&self, destination: &Destination, body: Bytes, persistent: bool) -> Result<()>;

    /// Start consuming from a queue; consumers of the same queue share its messages.
    async fn consume(&self, queue: &str) -> Result<Consumer>;
}

/// A broker-specific handle used to settle a delivery.
pub trait Acker: Send {
    /// Settle the delivery as handled.
    fn ack(self: Box<Self>);
    /// Settle the delivery as not handled, putting it back on its queue if `requeue` is set.
    fn nack(self: Box<Self>, requeue: bool);
}

/// A message delivered to a consumer.
pub struct Delivery {
    /// The message body.
    pub body: Bytes,
    /// Set if this message has been delivered before.
    pub redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    /// Create a new instance.
    pub fn new(body: Bytes, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker: Some(acker),
        }
    }

    /// Acknowledge this delivery.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// Reject this delivery, optionally requeuing it.
    pub fn nack(mut self, requeue: bool) {
        if let Some(acker) = self.acker.take() {
            acker.nack(requeue);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            tracing::debug!("requeuing unsettled delivery");
            acker.nack(true);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A consumer of a queue.
pub struct Consumer {
    /// The ID of this consumer.
    pub id: Uuid,
    /// The name of the queue this consumer reads.
    pub queue: String,
    deliveries: BoxStream<'static, Delivery>,
}

impl Consumer {
    /// Create a new instance over the given stream of deliveries.
    pub fn new(queue: String, deliveries: BoxStream<'static, Delivery>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            deliveries,
        }
    }

    /// Wait for the next delivery, `None` once the queue is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.next().await
    }
}
