//! Message bus mediator.
//!
//! Wraps a [`Broker`] with publish/subscribe, explicit acknowledgements and a
//! single background consumption loop.
//!
//! ```text
//! Disconnected ──connect──► Connected ──start_consuming──► Consuming
//!                               │                              │
//!                               └────────────close─────────────┴──► Closed
//! ```
//!
//! Messages of one queue are delivered in publish order, one at a time.
//! What happens to a nacked message is decided by the [`NackPolicy`].

mod broker;
mod file;

pub use broker::{Broker, Delivery, InMemoryBroker};
pub use file::FileBroker;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const INBOUND_QUEUE: &str = "tasks.inbound";
pub const FEEDBACK_QUEUE: &str = "tasks.feedback";

/// Suffix of the queue a dead-lettered message is moved to.
pub const DEAD_LETTER_SUFFIX: &str = ".dead";

/// How often the consumer re-checks the broker when nothing woke it up.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message bus is not connected")]
    NotConnected,

    #[error("Invalid queue name '{0}'")]
    InvalidQueue(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker directory {0} is locked by another process")]
    Locked(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connected,
    Consuming,
    Closed,
}

impl BusState {
    fn is_open(&self) -> bool {
        matches!(self, BusState::Connected | BusState::Consuming)
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusState::Disconnected => "disconnected",
            BusState::Connected => "connected",
            BusState::Consuming => "consuming",
            BusState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What to do with a message whose handler returned [`Acknowledgement::Nack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackPolicy {
    /// Discard it (at-most-once after the first failure)
    #[default]
    Drop,
    /// Re-append it to the tail of its queue
    Requeue,
    /// Move it to `<queue>.dead`
    DeadLetter,
}

impl NackPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "drop" => Some(Self::Drop),
            "requeue" => Some(Self::Requeue),
            "dead_letter" | "dead-letter" | "deadletter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub queue: String,
    pub body: Value,
    pub persistent: bool,
    pub published_at: String,
    /// Number of times the message was requeued after a nack
    #[serde(default)]
    pub redeliveries: u32,
}

impl Envelope {
    pub fn new(queue: &str, body: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            body,
            persistent: true,
            published_at: Utc::now().to_rfc3339(),
            redeliveries: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack,
}

/// Consumer of one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Acknowledgement;
}

struct Connection {
    state: BusState,
    broker: Option<Arc<dyn Broker>>,
}

pub struct MessageBus {
    connection: RwLock<Connection>,
    handlers: RwLock<BTreeMap<String, Arc<dyn MessageHandler>>>,
    nack_policy: NackPolicy,
    poll_interval: Duration,
    wakeup: Notify,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(nack_policy: NackPolicy) -> Self {
        Self {
            connection: RwLock::new(Connection {
                state: BusState::Disconnected,
                broker: None,
            }),
            handlers: RwLock::new(BTreeMap::new()),
            nack_policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wakeup: Notify::new(),
            cancel: CancellationToken::new(),
            consumer: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn nack_policy(&self) -> NackPolicy {
        self.nack_policy
    }

    pub async fn state(&self) -> BusState {
        self.connection.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_open()
    }

    /// Attach a broker. Only valid from `Disconnected`.
    pub async fn connect(&self, broker: Arc<dyn Broker>) -> Result<(), BusError> {
        let mut connection = self.connection.write().await;
        if connection.state != BusState::Disconnected {
            return Err(BusError::Broker(format!(
                "cannot connect from state {}",
                connection.state
            )));
        }
        tracing::info!("Message bus connected to {} broker", broker.name());
        connection.broker = Some(broker);
        connection.state = BusState::Connected;
        Ok(())
    }

    async fn broker(&self) -> Result<Arc<dyn Broker>, BusError> {
        let connection = self.connection.read().await;
        match (&connection.broker, connection.state.is_open()) {
            (Some(broker), true) => Ok(Arc::clone(broker)),
            _ => Err(BusError::NotConnected),
        }
    }

    /// Store `message` durably on `queue`. Returns once the broker has it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
    ) -> Result<Uuid, BusError> {
        let broker = match self.broker().await {
            Ok(broker) => broker,
            Err(err) => {
                tracing::warn!("Cannot publish to {}: {}", queue, err);
                return Err(err);
            }
        };
        let envelope = Envelope::new(queue, serde_json::to_value(message)?);
        broker.enqueue(&envelope).await?;
        tracing::debug!("Published message {} to {}", envelope.id, queue);
        self.wakeup.notify_one();
        Ok(envelope.id)
    }

    /// Register the handler for `queue`, replacing any previous one.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        if !self.is_connected().await {
            tracing::warn!("Cannot subscribe to {}: bus not connected", queue);
            return Err(BusError::NotConnected);
        }
        self.handlers.write().await.insert(queue.to_string(), handler);
        tracing::info!("Subscribed to queue {}", queue);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Spawn the consumption loop. Calling it again while consuming is a no-op.
    pub async fn start_consuming(self: &Arc<Self>) -> Result<(), BusError> {
        {
            let mut connection = self.connection.write().await;
            match connection.state {
                BusState::Connected => connection.state = BusState::Consuming,
                BusState::Consuming => return Ok(()),
                BusState::Disconnected | BusState::Closed => return Err(BusError::NotConnected),
            }
        }

        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(bus.run_consumer())
                .catch_unwind()
                .await;
            if let Err(err) = result {
                tracing::error!("Message bus consumer panicked: {:?}", err);
            }
        });
        *self.consumer.lock().await = Some(handle);
        tracing::info!("Message bus consumption started");
        Ok(())
    }

    /// Stop consumption and release the broker.
    pub async fn close(&self) -> Result<(), BusError> {
        self.cancel.cancel();
        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::warn!("Message bus consumer ended abnormally: {}", err);
            }
        }

        let broker = {
            let mut connection = self.connection.write().await;
            connection.state = BusState::Closed;
            connection.broker.take()
        };
        if let Some(broker) = broker {
            broker.close().await?;
        }
        tracing::info!("Message bus closed");
        Ok(())
    }

    /// Messages waiting on `queue` (0 when not connected).
    pub async fn queue_length(&self, queue: &str) -> usize {
        match self.broker().await {
            Ok(broker) => broker.pending(queue).await.unwrap_or_else(|err| {
                tracing::warn!("Failed to count messages on {}: {}", queue, err);
                0
            }),
            Err(_) => 0,
        }
    }

    async fn run_consumer(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let progressed = match self.deliver_round().await {
                Ok(progressed) => progressed,
                Err(err) => {
                    tracing::error!("Message bus delivery failed: {}", err);
                    false
                }
            };

            if !progressed {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        tracing::debug!("Message bus consumer stopped");
    }

    /// Deliver at most one message per subscribed queue. Returns whether any
    /// message left its queue.
    async fn deliver_round(&self) -> Result<bool, BusError> {
        let broker = self.broker().await?;
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = self
            .handlers
            .read()
            .await
            .iter()
            .map(|(queue, handler)| (queue.clone(), Arc::clone(handler)))
            .collect();

        let mut progressed = false;
        for (queue, handler) in handlers {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(delivery) = broker.next(&queue).await? else {
                continue;
            };
            progressed |= self.deliver(broker.as_ref(), handler.as_ref(), delivery).await?;
        }
        Ok(progressed)
    }

    async fn deliver(
        &self,
        broker: &dyn Broker,
        handler: &dyn MessageHandler,
        delivery: Delivery,
    ) -> Result<bool, BusError> {
        let envelope = &delivery.envelope;
        let ack = match std::panic::AssertUnwindSafe(handler.handle(envelope))
            .catch_unwind()
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                tracing::error!(
                    "Handler for {} panicked on message {}: {:?}",
                    envelope.queue,
                    envelope.id,
                    err
                );
                Acknowledgement::Nack
            }
        };

        match (ack, self.nack_policy) {
            (Acknowledgement::Ack, _) => {
                broker.ack(&delivery).await?;
                Ok(true)
            }
            (Acknowledgement::Nack, NackPolicy::Drop) => {
                tracing::warn!(
                    "Message {} on {} nacked; dropping it",
                    envelope.id,
                    envelope.queue
                );
                broker.ack(&delivery).await?;
                Ok(true)
            }
            (Acknowledgement::Nack, NackPolicy::Requeue) => {
                tracing::warn!(
                    "Message {} on {} nacked; requeueing (redelivery {})",
                    envelope.id,
                    envelope.queue,
                    envelope.redeliveries + 1
                );
                broker.requeue(delivery).await?;
                // Not progress: a message that keeps failing must not spin the loop
                Ok(false)
            }
            (Acknowledgement::Nack, NackPolicy::DeadLetter) => {
                tracing::warn!(
                    "Message {} on {} nacked; moving it to {}{}",
                    envelope.id,
                    envelope.queue,
                    envelope.queue,
                    DEAD_LETTER_SUFFIX
                );
                broker.dead_letter(delivery).await?;
                Ok(true)
            }
        }
    }
}

/// Queue names become directory names in the file broker.
pub(crate) fn check_queue_name(queue: &str) -> Result<(), BusError> {
    let valid = !queue.is_empty()
        && !queue.starts_with('.')
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidQueue(queue.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records bodies; nacks the first `fail_first` deliveries, panics on `{"panic": true}`.
    struct Recorder {
        seen: StdMutex<Vec<Value>>,
        fail_first: AtomicUsize,
    }

    impl Recorder {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }

        fn seen(&self) -> Vec<Value> {
            self.seen.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, envelope: &Envelope) -> Acknowledgement {
            if envelope.body.get("panic").is_some() {
                panic!("handler blew up");
            }
            self.seen.lock().expect("lock").push(envelope.body.clone());
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                Acknowledgement::Nack
            } else {
                Acknowledgement::Ack
            }
        }
    }

    async fn connected(policy: NackPolicy) -> (Arc<MessageBus>, Arc<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = Arc::new(MessageBus::new(policy).with_poll_interval(Duration::from_millis(10)));
        bus.connect(broker.clone()).await.expect("connect");
        (bus, broker)
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let bus = MessageBus::new(NackPolicy::Drop);
        assert_eq!(bus.state().await, BusState::Disconnected);
        assert!(matches!(
            bus.publish(INBOUND_QUEUE, &serde_json::json!({})).await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            bus.subscribe(INBOUND_QUEUE, Recorder::new(0)).await,
            Err(BusError::NotConnected)
        ));
        assert_eq!(bus.queue_length(INBOUND_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let (bus, _) = connected(NackPolicy::Drop).await;
        let recorder = Recorder::new(0);
        for i in 0..5 {
            bus.publish(INBOUND_QUEUE, &serde_json::json!({ "n": i }))
                .await
                .expect("publish");
        }
        assert_eq!(bus.queue_length(INBOUND_QUEUE).await, 5);

        bus.subscribe(INBOUND_QUEUE, recorder.clone()).await.expect("subscribe");
        bus.start_consuming().await.expect("start");
        assert_eq!(bus.state().await, BusState::Consuming);

        wait_until(|| recorder.seen().len() == 5).await;
        let order: Vec<i64> = recorder
            .seen()
            .iter()
            .filter_map(|v| v["n"].as_i64())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        bus.close().await.expect("close");
        assert_eq!(bus.state().await, BusState::Closed);
    }

    #[tokio::test]
    async fn test_nack_drop_discards() {
        let (bus, broker) = connected(NackPolicy::Drop).await;
        let recorder = Recorder::new(1);
        bus.subscribe(FEEDBACK_QUEUE, recorder.clone()).await.expect("subscribe");
        bus.start_consuming().await.expect("start");
        bus.publish(FEEDBACK_QUEUE, &serde_json::json!({"x": 1}))
            .await
            .expect("publish");

        wait_until(|| recorder.seen().len() == 1).await;
        bus.close().await.expect("close");
        assert_eq!(recorder.seen().len(), 1);
        assert_eq!(broker.pending(FEEDBACK_QUEUE).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let (bus, _) = connected(NackPolicy::Requeue).await;
        let recorder = Recorder::new(2);
        bus.subscribe(INBOUND_QUEUE, recorder.clone()).await.expect("subscribe");
        bus.start_consuming().await.expect("start");
        bus.publish(INBOUND_QUEUE, &serde_json::json!({"x": 1}))
            .await
            .expect("publish");

        wait_until(|| recorder.seen().len() == 3).await;
        bus.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered() {
        let (bus, broker) = connected(NackPolicy::DeadLetter).await;
        let recorder = Recorder::new(0);
        bus.subscribe(INBOUND_QUEUE, recorder.clone()).await.expect("subscribe");
        bus.start_consuming().await.expect("start");
        bus.publish(INBOUND_QUEUE, &serde_json::json!({"panic": true}))
            .await
            .expect("publish");
        bus.publish(INBOUND_QUEUE, &serde_json::json!({"after": true}))
            .await
            .expect("publish");

        // The loop survives the panic and keeps delivering
        wait_until(|| recorder.seen().len() == 1).await;
        bus.close().await.expect("close");
        let dead = format!("{}{}", INBOUND_QUEUE, DEAD_LETTER_SUFFIX);
        assert_eq!(broker.pending(&dead).await.expect("count"), 1);
        assert_eq!(broker.pending(INBOUND_QUEUE).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_close_without_consuming() {
        let (bus, _) = connected(NackPolicy::Drop).await;
        bus.close().await.expect("close");
        assert_eq!(bus.state().await, BusState::Closed);
        assert!(matches!(
            bus.publish(INBOUND_QUEUE, &serde_json::json!({})).await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            bus.start_consuming().await,
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (bus, _) = connected(NackPolicy::Drop).await;
        assert!(bus.connect(Arc::new(InMemoryBroker::new())).await.is_err());
    }

    #[test]
    fn test_nack_policy_parsing() {
        assert_eq!(NackPolicy::parse("DROP"), Some(NackPolicy::Drop));
        assert_eq!(NackPolicy::parse("requeue"), Some(NackPolicy::Requeue));
        assert_eq!(NackPolicy::parse("dead-letter"), Some(NackPolicy::DeadLetter));
        assert_eq!(NackPolicy::parse("retry"), None);
        assert_eq!(NackPolicy::default(), NackPolicy::Drop);
    }

    #[test]
    fn test_queue_names() {
        assert!(check_queue_name(INBOUND_QUEUE).is_ok());
        assert!(check_queue_name("tasks.inbound.dead").is_ok());
        assert!(check_queue_name("../escape").is_err());
        assert!(check_queue_name("").is_err());
    }
}
