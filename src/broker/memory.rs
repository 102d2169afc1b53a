//! In-memory broker (no network)
//!
//! This backend routes messages between emitters and receivers inside the
//! process. It's useful for:
//! - Testing the probe protocol without a live cluster
//! - Injecting failures at every stage of a round trip
//! - Counting how many connections, producers and consumers were created
//!
//! ## Limitations
//!
//! - **No persistence**: messages are only delivered to receivers that are
//!   subscribed at publish time (latest position semantics)
//! - **Single subscription consumer**: a second consumer on the same
//!   subscription is rejected, like an exclusive Pulsar subscription

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    BrokerError, BrokerResult, Connection, Connector, Credentials, Emitter, Endpoint, MessageId,
    PendingSend, ReceivedMessage, Receiver, SendCompletion, TopicName,
};

/// Failures and delays injected into the broker
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// `connect` fails
    pub refuse_connections: bool,

    /// `connect` to one of these hosts takes `connect_delay`
    pub slow_hosts: Vec<String>,
    pub connect_delay: Duration,

    /// `receive` panics instead of returning
    pub panic_on_receive: bool,

    /// `create_emitter` fails
    pub refuse_producers: bool,

    /// `subscribe` fails
    pub refuse_subscriptions: bool,

    /// Sends are rejected by the broker
    pub reject_sends: bool,

    /// Sends are delivered but the acknowledgement never arrives
    pub withhold_send_acks: bool,

    /// Sends are acknowledged but never delivered to consumers
    pub drop_messages: bool,

    /// Delay between submission and delivery to consumers
    pub delivery_delay: Duration,

    /// Delay between submission and the send acknowledgement
    pub ack_delay: Duration,

    /// Number of receive calls that fail before messages are handed out
    pub receive_errors: usize,

    /// Payloads delivered to every new consumer right after it subscribes
    pub backlog: Vec<Vec<u8>>,
}

/// Counters of everything the broker handed out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_created: usize,
    pub connections_closed: usize,
    pub producers_created: usize,
    pub producers_closed: usize,
    pub consumers_created: usize,
    pub consumers_closed: usize,
    pub messages_published: usize,
    pub messages_acked: usize,
}

#[derive(Default)]
struct Counters {
    connections_created: AtomicUsize,
    connections_closed: AtomicUsize,
    producers_created: AtomicUsize,
    producers_closed: AtomicUsize,
    consumers_created: AtomicUsize,
    consumers_closed: AtomicUsize,
    messages_published: AtomicUsize,
    messages_acked: AtomicUsize,
}

type Subscriptions = HashMap<TopicName, HashMap<String, mpsc::UnboundedSender<ReceivedMessage>>>;

#[derive(Default)]
struct BrokerState {
    faults: Mutex<Faults>,
    counters: Counters,
    subscriptions: Mutex<Subscriptions>,
    // acknowledgements that are never going to be resolved
    parked: Mutex<Vec<SendCompletion>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrokerState {
    fn faults(&self) -> Faults {
        lock(&self.faults).clone()
    }

    fn next_message_id(&self) -> MessageId {
        MessageId(format!("{}:0:-1", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn deliver(&self, topic: &TopicName, message: ReceivedMessage) {
        let subscriptions = lock(&self.subscriptions);
        let Some(subscribers) = subscriptions.get(topic) else {
            trace!("no consumers on {topic}, message dropped");
            return;
        };

        for subscriber in subscribers.values() {
            let _ = subscriber.send(message.clone());
        }
    }
}

/// Handle to an in-memory broker; acts as the [`Connector`]
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        let broker = Self::new();
        broker.set_faults(faults);
        broker
    }

    pub fn set_faults(&self, faults: Faults) {
        *lock(&self.state.faults) = faults;
    }

    pub fn update_faults(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut lock(&self.state.faults));
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.state.counters;
        BrokerStats {
            connections_created: c.connections_created.load(Ordering::SeqCst),
            connections_closed: c.connections_closed.load(Ordering::SeqCst),
            producers_created: c.producers_created.load(Ordering::SeqCst),
            producers_closed: c.producers_closed.load(Ordering::SeqCst),
            consumers_created: c.consumers_created.load(Ordering::SeqCst),
            consumers_closed: c.consumers_closed.load(Ordering::SeqCst),
            messages_published: c.messages_published.load(Ordering::SeqCst),
            messages_acked: c.messages_acked.load(Ordering::SeqCst),
        }
    }

    /// Publish a message that did not come from an emitter
    pub fn publish(&self, topic: &TopicName, payload: impl Into<Vec<u8>>) {
        let message = ReceivedMessage {
            id: self.state.next_message_id(),
            payload: payload.into(),
        };
        self.state.deliver(topic, message);
    }

    /// Number of consumers currently subscribed to `topic`
    pub fn consumer_count(&self, topic: &TopicName) -> usize {
        lock(&self.state.subscriptions)
            .get(topic)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> BrokerResult<MemoryConnection> {
        let faults = self.state.faults();
        if faults.slow_hosts.iter().any(|host| host == endpoint.host()) {
            tokio::time::sleep(faults.connect_delay).await;
        }
        if faults.refuse_connections {
            return Err(BrokerError::ConnectionFailed(format!(
                "{endpoint}: connection refused"
            )));
        }

        let id = self
            .state
            .counters
            .connections_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct MemoryConnection {
    id: usize,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Sequence number of this connection within its broker
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Emitter = MemoryEmitter;
    type Receiver = MemoryReceiver;

    async fn create_emitter(&self, topic: &TopicName) -> BrokerResult<MemoryEmitter> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if self.state.faults().refuse_producers {
            return Err(BrokerError::ProducerFailed(format!("{topic}: producer refused")));
        }

        self.state
            .counters
            .producers_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(MemoryEmitter {
            state: Arc::clone(&self.state),
            topic: topic.clone(),
            closed: false,
        })
    }

    async fn subscribe(&self, topic: &TopicName, subscription: &str) -> BrokerResult<MemoryReceiver> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let faults = self.state.faults();
        if faults.refuse_subscriptions {
            return Err(BrokerError::SubscribeFailed(format!(
                "{topic}: subscription refused"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut subscriptions = lock(&self.state.subscriptions);
            let subscribers = subscriptions.entry(topic.clone()).or_default();
            if subscribers.contains_key(subscription) {
                return Err(BrokerError::SubscribeFailed(format!(
                    "{topic}: exclusive consumer already connected to {subscription}"
                )));
            }
            subscribers.insert(subscription.to_string(), tx.clone());
        }

        for payload in faults.backlog {
            let _ = tx.send(ReceivedMessage {
                id: self.state.next_message_id(),
                payload,
            });
        }

        self.state
            .counters
            .consumers_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(MemoryReceiver {
            state: Arc::clone(&self.state),
            topic: topic.clone(),
            subscription: subscription.to_string(),
            rx,
            closed: false,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state
                .counters
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct MemoryEmitter {
    state: Arc<BrokerState>,
    topic: TopicName,
    closed: bool,
}

#[async_trait]
impl Emitter for MemoryEmitter {
    fn send_async(&self, payload: Vec<u8>) -> PendingSend {
        if self.closed {
            return PendingSend::failed(BrokerError::Closed);
        }

        let faults = self.state.faults();
        if faults.reject_sends {
            return PendingSend::failed(BrokerError::SendFailed(format!(
                "{}: send rejected",
                self.topic
            )));
        }

        self.state
            .counters
            .messages_published
            .fetch_add(1, Ordering::SeqCst);

        let id = self.state.next_message_id();
        let (completion, pending) = PendingSend::channel();

        if faults.withhold_send_acks {
            lock(&self.state.parked).push(completion);
        } else {
            let ack_id = id.clone();
            let ack_delay = faults.ack_delay;
            tokio::spawn(async move {
                tokio::time::sleep(ack_delay).await;
                completion.complete(Ok(ack_id));
            });
        }

        if !faults.drop_messages {
            let state = Arc::clone(&self.state);
            let topic = self.topic.clone();
            let delivery_delay = faults.delivery_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delivery_delay).await;
                state.deliver(&topic, ReceivedMessage { id, payload });
            });
        }

        pending
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state
                .counters
                .producers_closed
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct MemoryReceiver {
    state: Arc<BrokerState>,
    topic: TopicName,
    subscription: String,
    rx: mpsc::UnboundedReceiver<ReceivedMessage>,
    closed: bool,
}

impl MemoryReceiver {
    fn take_receive_error(&self) -> bool {
        let mut faults = lock(&self.state.faults);
        if faults.receive_errors == 0 {
            return false;
        }
        faults.receive_errors -= 1;
        true
    }
}

#[async_trait]
impl Receiver for MemoryReceiver {
    async fn receive(&mut self) -> BrokerResult<ReceivedMessage> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.state.faults().panic_on_receive {
            panic!("receive on {} crashed", self.topic);
        }
        if self.take_receive_error() {
            return Err(BrokerError::ReceiveFailed("injected receive failure".to_string()));
        }

        self.rx.recv().await.ok_or(BrokerError::Closed)
    }

    async fn ack(&mut self, _message: &ReceivedMessage) -> BrokerResult<()> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.state
            .counters
            .messages_acked
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(subscribers) = lock(&self.state.subscriptions).get_mut(&self.topic) {
            subscribers.remove(&self.subscription);
        }
        self.state
            .counters
            .consumers_closed
            .fetch_add(1, Ordering::SeqCst);
    }
}
