//! Broker client capabilities
//!
//! The latency probe only needs a handful of operations from a messaging
//! client. They are split into three narrow traits so that the probe can run
//! against the real Pulsar WebSocket API as well as against an in-memory broker:
//!
//! - **Connector**: builds a long-lived [`Connection`] for an [`Endpoint`]
//! - **Emitter**: a producer that submits messages without blocking
//! - **Receiver**: an exclusive consumer that receives and acknowledges messages
//!
//! ## Backends
//!
//! - **websocket**: Pulsar WebSocket API over `tokio-tungstenite`
//! - **memory**: in-process broker with failure injection, used by tests

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::oneshot;
use url::Url;

pub mod error;
pub mod memory;
pub mod websocket;

pub use error::{BrokerError, BrokerResult};

/// Default CA bundle (RHEL/CentOS location)
pub const DEFAULT_TRUST_STORE: &str = "/etc/ssl/certs/ca-bundle.crt";

/// Broker connection URI, e.g. `wss://useast1.example.com:8443`
///
/// Identity key of the connection cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn parse(uri: &str) -> BrokerResult<Self> {
        let url = Url::parse(uri).map_err(|e| BrokerError::InvalidEndpoint(format!("{uri}: {e}")))?;

        if url.host_str().is_none_or(str::is_empty) {
            return Err(BrokerError::InvalidEndpoint(format!("{uri}: missing host")));
        }

        Ok(Self(url))
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.0.port_or_known_default()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    /// Human readable cluster name used in logs and alerts
    pub fn display_name(&self) -> String {
        self.host().to_string()
    }
}

impl FromStr for Endpoint {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Url always renders a trailing slash for an empty path
        write!(f, "{}", self.0.as_str().trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicDomain {
    Persistent,
    NonPersistent,
}

impl TopicDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicDomain::Persistent => "persistent",
            TopicDomain::NonPersistent => "non-persistent",
        }
    }
}

/// Fully qualified topic name: `{domain}://{tenant}/{namespace}/{topic}`
///
/// Short names are expanded the way Pulsar does it: `my-topic` becomes
/// `persistent://public/default/my-topic` and `t/ns/topic` becomes
/// `persistent://t/ns/topic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    domain: TopicDomain,
    tenant: String,
    namespace: String,
    local: String,
}

impl TopicName {
    pub fn parse(name: &str) -> BrokerResult<Self> {
        let invalid = || BrokerError::InvalidTopic(name.to_string());

        let (domain, rest) = match name.split_once("://") {
            Some(("persistent", rest)) => (TopicDomain::Persistent, rest),
            Some(("non-persistent", rest)) => (TopicDomain::NonPersistent, rest),
            Some(_) => return Err(invalid()),
            None => (TopicDomain::Persistent, name),
        };

        let parts: Vec<&str> = rest.split('/').collect();
        let (tenant, namespace, local) = match parts.as_slice() {
            [local] if !name.contains("://") => ("public", "default", *local),
            [tenant, namespace, local] => (*tenant, *namespace, *local),
            _ => return Err(invalid()),
        };

        if [tenant, namespace, local].iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }

        Ok(Self {
            domain,
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            local: local.to_string(),
        })
    }

    pub fn domain(&self) -> TopicDomain {
        self.domain
    }

    /// `{domain}/{tenant}/{namespace}/{topic}`, the form used in REST paths
    pub fn rest_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.domain.as_str(),
            self.tenant,
            self.namespace,
            self.local
        )
    }
}

impl FromStr for TopicName {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}/{}",
            self.domain.as_str(),
            self.tenant,
            self.namespace,
            self.local
        )
    }
}

/// Authentication material used when a connection is constructed
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub trust_store: PathBuf,
}

impl Credentials {
    pub fn new(token: Option<String>, trust_store: Option<PathBuf>) -> Self {
        Self {
            token: token.filter(|token| !token.is_empty()),
            trust_store: trust_store.unwrap_or_else(|| PathBuf::from(DEFAULT_TRUST_STORE)),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("trust_store", &self.trust_store)
            .finish()
    }
}

/// Broker assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered to a [`Receiver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// Acknowledgement of a submitted message that has not arrived yet
///
/// Created together with a [`SendCompletion`], which the producer side resolves
/// exactly once when the broker answers.
#[derive(Debug)]
pub struct PendingSend {
    rx: oneshot::Receiver<BrokerResult<MessageId>>,
}

impl PendingSend {
    pub fn channel() -> (SendCompletion, PendingSend) {
        let (tx, rx) = oneshot::channel();
        (SendCompletion { tx }, PendingSend { rx })
    }

    /// A send that failed before it could be submitted
    pub fn failed(error: BrokerError) -> Self {
        let (completion, pending) = Self::channel();
        completion.complete(Err(error));
        pending
    }

    /// Wait for the broker to acknowledge the message
    ///
    /// A completion that is dropped without being resolved (e.g. the producer
    /// was closed) yields [`BrokerError::Closed`].
    pub async fn acknowledged(self) -> BrokerResult<MessageId> {
        self.rx.await.unwrap_or(Err(BrokerError::Closed))
    }
}

/// Write side of a [`PendingSend`]
#[derive(Debug)]
pub struct SendCompletion {
    tx: oneshot::Sender<BrokerResult<MessageId>>,
}

impl SendCompletion {
    pub fn complete(self, result: BrokerResult<MessageId>) {
        // the waiting side may already have given up
        let _ = self.tx.send(result);
    }
}

/// Builds connections to a broker cluster
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Construct a new connection for `endpoint`
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> BrokerResult<Self::Connection>;
}

/// Long-lived client handle bound to one endpoint
///
/// Shared by all probes against the endpoint, so implementations must be
/// usable through `&self` from several tasks.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Emitter: Emitter;
    type Receiver: Receiver;

    /// Open a producer on `topic`
    async fn create_emitter(&self, topic: &TopicName) -> BrokerResult<Self::Emitter>;

    /// Open an exclusive consumer on `topic`, positioned at the latest message
    async fn subscribe(&self, topic: &TopicName, subscription: &str)
    -> BrokerResult<Self::Receiver>;

    /// Release the connection. Called once, after every emitter and receiver
    /// created from it has been closed.
    async fn close(&self);
}

/// Producer side of a probe session
#[async_trait]
pub trait Emitter: Send + 'static {
    /// Submit `payload` without waiting for the broker
    fn send_async(&self, payload: Vec<u8>) -> PendingSend;

    async fn close(&mut self);
}

/// Consumer side of a probe session
#[async_trait]
pub trait Receiver: Send + 'static {
    /// Wait for the next message
    ///
    /// Must be cancel safe: dropping the future must not lose a message that
    /// has not been returned yet.
    async fn receive(&mut self) -> BrokerResult<ReceivedMessage>;

    async fn ack(&mut self, message: &ReceivedMessage) -> BrokerResult<()>;

    async fn close(&mut self);
}
