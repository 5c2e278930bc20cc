//! Broker abstraction and the in-memory broker.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{check_queue_name, BusError, Envelope, DEAD_LETTER_SUFFIX};

/// A message handed to the consumer. It stays on its queue until acked,
/// requeued or dead-lettered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Broker-specific handle of the stored message
    pub receipt: String,
}

/// Durable FIFO queues.
///
/// One consumer per queue is assumed: `next` returns the head without
/// removing it, and the consumer settles it before asking again.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    /// Store a message at the tail of `envelope.queue`.
    async fn enqueue(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Head of `queue`, if any.
    async fn next(&self, queue: &str) -> Result<Option<Delivery>, BusError>;

    /// Remove a delivered message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Move a delivered message to the tail of its queue.
    async fn requeue(&self, delivery: Delivery) -> Result<(), BusError>;

    /// Move a delivered message to `<queue>.dead`.
    async fn dead_letter(&self, delivery: Delivery) -> Result<(), BusError>;

    /// Number of messages stored on `queue`.
    async fn pending(&self, queue: &str) -> Result<usize, BusError>;

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

pub(crate) fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Non-persistent broker, for tests and single-process setups.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Envelope>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the delivered message off the head of its queue.
    async fn take(&self, delivery: &Delivery) -> Option<Envelope> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(&delivery.envelope.queue)?;
        let position = queue
            .iter()
            .position(|e| e.id.to_string() == delivery.receipt)?;
        queue.remove(position)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enqueue(&self, envelope: &Envelope) -> Result<(), BusError> {
        check_queue_name(&envelope.queue)?;
        self.queues
            .lock()
            .await
            .entry(envelope.queue.clone())
            .or_default()
            .push_back(envelope.clone());
        Ok(())
    }

    async fn next(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .and_then(|q| q.front())
            .map(|envelope| Delivery {
                envelope: envelope.clone(),
                receipt: envelope.id.to_string(),
            }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        if self.take(delivery).await.is_none() {
            tracing::warn!("Acked message {} was not on its queue", delivery.receipt);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: Delivery) -> Result<(), BusError> {
        let mut envelope = self.take(&delivery).await.unwrap_or(delivery.envelope);
        envelope.redeliveries += 1;
        self.enqueue(&envelope).await
    }

    async fn dead_letter(&self, delivery: Delivery) -> Result<(), BusError> {
        let mut envelope = self.take(&delivery).await.unwrap_or(delivery.envelope);
        envelope.queue = dead_letter_queue(&envelope.queue);
        self.enqueue(&envelope).await
    }

    async fn pending(&self, queue: &str) -> Result<usize, BusError> {
        Ok(self.queues.lock().await.get(queue).map_or(0, VecDeque::len))
    }
}
