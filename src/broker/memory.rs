use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::broker::{Acker, Broker, Consumer, Delivery, Destination, ExchangeKind};
use crate::error::AppError;

/// A message held in a queue.
#[derive(Debug)]
struct QueuedMessage {
    body: Bytes,
    redelivered: bool,
}

/// A bounded in-memory queue.
#[derive(Clone)]
struct MemoryQueue {
    tx: mpsc::Sender<QueuedMessage>,
    /// Shared by every consumer of the queue, so that each message goes to one of them.
    rx: Arc<Mutex<mpsc::Receiver<QueuedMessage>>>,
}

struct MemoryExchange {
    kind: ExchangeKind,
    /// Bound queues along with their binding keys.
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, MemoryExchange>,
}

/// A broker living in the memory of the current process.
#[derive(Clone)]
pub struct MemoryBroker {
    capacity: usize,
    topology: Arc<RwLock<Topology>>,
}

impl MemoryBroker {
    /// Create a new instance whose queues hold at most `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topology: Default::default(),
        }
    }

    /// The number of messages currently waiting in the given queue.
    #[cfg(test)]
    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        let topology = self.topology.read().await;
        match topology.queues.get(queue) {
            Some(queue) => Ok(queue.tx.max_capacity() - queue.tx.capacity()),
            None => bail!(AppError::ResourceNotFound(format!("queue {}", queue))),
        }
    }

    /// Resolve the queues a publication to the given destination lands in.
    async fn route(&self, destination: &Destination) -> Result<Vec<MemoryQueue>> {
        let topology = self.topology.read().await;
        match destination {
            Destination::Queue(name) => match topology.queues.get(name) {
                Some(queue) => Ok(vec![queue.clone()]),
                None => bail!(AppError::ResourceNotFound(format!("queue {}", name))),
            },
            Destination::Exchange { name, routing_key } => {
                let exchange = match topology.exchanges.get(name) {
                    Some(exchange) => exchange,
                    None => bail!(AppError::ResourceNotFound(format!("exchange {}", name))),
                };
                Ok(exchange
                    .bindings
                    .iter()
                    .filter(|(_, key)| exchange.kind == ExchangeKind::Fanout || key == routing_key)
                    .filter_map(|(queue, _)| topology.queues.get(queue).cloned())
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        let mut topology = self.topology.write().await;
        if topology.queues.contains_key(name) {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        topology.queues.insert(
            name.into(),
            MemoryQueue {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            },
        );
        tracing::debug!(queue = name, "queue declared");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut topology = self.topology.write().await;
        if let Some(existing) = topology.exchanges.get(name) {
            if existing.kind != kind {
                bail!(AppError::InvalidInput(format!(
                    "exchange {} already declared as {:?}, can not redeclare as {:?}",
                    name, existing.kind, kind
                )));
            }
            return Ok(());
        }
        topology.exchanges.insert(name.into(), MemoryExchange { kind, bindings: vec![] });
        tracing::debug!(exchange = name, ?kind, "exchange declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut topology = self.topology.write().await;
        if !topology.queues.contains_key(queue) {
            bail!(AppError::ResourceNotFound(format!("queue {}", queue)));
        }
        let exchange = match topology.exchanges.get_mut(exchange) {
            Some(exchange) => exchange,
            None => bail!(AppError::ResourceNotFound(format!("exchange {}", exchange))),
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, destination: &Destination, body: Bytes, persistent: bool) -> Result<()> {
        // Memory queues do not outlive the process, persistent or not.
        tracing::trace!(%destination, persistent, len = body.len(), "publishing message");
        let queues = self.route(destination).await?;
        if queues.is_empty() {
            tracing::trace!(%destination, "message unroutable, dropping");
        }
        for queue in queues {
            let msg = QueuedMessage {
                body: body.clone(),
                redelivered: false,
            };
            if queue.tx.send(msg).await.is_err() {
                bail!(AppError::ResourceNotFound(format!("{} is closed", destination)));
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        let target = {
            let topology = self.topology.read().await;
            match topology.queues.get(queue) {
                Some(target) => target.clone(),
                None => bail!(AppError::ResourceNotFound(format!("queue {}", queue))),
            }
        };
        let deliveries = futures::stream::unfold(target, |target| async move {
            let msg = target.rx.lock().await.recv().await?;
            let acker = Box::new(MemoryAcker {
                tx: target.tx.clone(),
                body: msg.body.clone(),
            });
            Some((Delivery::new(msg.body, msg.redelivered, acker), target))
        });
        Ok(Consumer::new(queue.into(), Box::pin(deliveries)))
    }
}

/// Settles deliveries of a memory queue.
struct MemoryAcker {
    tx: mpsc::Sender<QueuedMessage>,
    body: Bytes,
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>, requeue: bool) {
        if !requeue {
            return;
        }
        let Self { tx, body } = *self;
        let msg = QueuedMessage { body, redelivered: true };
        match tx.try_send(msg) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(msg)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = tx.send(msg).await;
                    });
                }
                Err(_) => tracing::warn!("queue full and no runtime available, dropping requeued message"),
            },
            Err(mpsc::error::TrySendError::Closed(_)) => tracing::debug!("queue closed, dropping requeued message"),
        }
    }
}
