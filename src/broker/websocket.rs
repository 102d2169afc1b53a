//! Pulsar WebSocket API client
//!
//! Every producer and consumer is its own WebSocket:
//!
//! ```text
//! producer: {ws|wss}://host:port/ws/v2/producer/persistent/{tenant}/{ns}/{topic}
//! consumer: {ws|wss}://host:port/ws/v2/consumer/persistent/{tenant}/{ns}/{topic}/{subscription}
//! ```
//!
//! The "connection" therefore holds what all sockets to one endpoint share:
//! the bearer token and the TLS configuration built from the trust store.
//! A new consumer starts at the latest message, which is what the probe needs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use futures::{SinkExt, StreamExt};
use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    Connector as TlsConnector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tracing::{debug, instrument, trace, warn};

use super::{
    BrokerError, BrokerResult, Connection, Connector, Credentials, Emitter, Endpoint, MessageId,
    PendingSend, ReceivedMessage, Receiver, SendCompletion, TopicName,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long closing a producer may take before its task is aborted
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct ProducerFrame {
    payload: String,
    context: String,
}

#[derive(Debug, Deserialize)]
struct ProducerReply {
    result: String,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    #[serde(rename = "errorMsg")]
    error_msg: Option<String>,
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsumerFrame {
    #[serde(rename = "messageId")]
    message_id: String,
    payload: String,
}

#[derive(Debug, Serialize)]
struct AckFrame<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

/// [`Connector`] for the Pulsar WebSocket API
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Connection = WebSocketConnection;

    #[instrument(skip_all, fields(endpoint = %endpoint))]
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> BrokerResult<WebSocketConnection> {
        let tls = match endpoint.scheme() {
            "ws" => None,
            "wss" => Some(Arc::new(load_tls_config(&credentials.trust_store)?)),
            other => {
                return Err(BrokerError::ConnectionFailed(format!(
                    "{endpoint}: unsupported scheme {other}, expected ws or wss"
                )));
            }
        };

        debug!("prepared websocket connection (tls: {})", tls.is_some());

        Ok(WebSocketConnection {
            endpoint: endpoint.clone(),
            token: credentials.token.clone(),
            tls,
            closed: AtomicBool::new(false),
        })
    }
}

fn load_tls_config(trust_store: &Path) -> BrokerResult<rustls::ClientConfig> {
    let fail = |msg: String| {
        BrokerError::ConnectionFailed(format!("trust store {}: {msg}", trust_store.display()))
    };

    let mut roots = RootCertStore::empty();
    let certs = CertificateDer::pem_file_iter(trust_store).map_err(|e| fail(format!("{e:?}")))?;
    for cert in certs {
        let cert = cert.map_err(|e| fail(format!("{e:?}")))?;
        roots.add(cert).map_err(|e| fail(e.to_string()))?;
    }

    if roots.is_empty() {
        return Err(fail("no certificates found".to_string()));
    }

    let config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| fail(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(config)
}

pub struct WebSocketConnection {
    endpoint: Endpoint,
    token: Option<String>,
    tls: Option<Arc<rustls::ClientConfig>>,
    closed: AtomicBool,
}

impl WebSocketConnection {
    fn request(&self, path: &str, query: Option<&str>) -> Result<Request, String> {
        let mut url = self.endpoint.url().clone();
        url.set_path(path);
        url.set_query(query);

        let mut request = url.as_str().into_client_request().map_err(|e| e.to_string())?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| "token is not a valid header value".to_string())?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }

    async fn open(&self, path: &str, query: Option<&str>) -> Result<WsStream, String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err("connection already closed".to_string());
        }

        let request = self.request(path, query)?;
        let connector = self
            .tls
            .as_ref()
            .map(|config| TlsConnector::Rustls(Arc::clone(config)));

        let (stream, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| format!("{}{path}: {e}", self.endpoint))?;

        trace!("websocket handshake for {path} answered {}", response.status());

        Ok(stream)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    type Emitter = WebSocketEmitter;
    type Receiver = WebSocketReceiver;

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn create_emitter(&self, topic: &TopicName) -> BrokerResult<WebSocketEmitter> {
        let path = format!("/ws/v2/producer/{}", topic.rest_path());
        let stream = self.open(&path, None).await.map_err(BrokerError::ProducerFailed)?;

        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_producer(stream, rx));

        Ok(WebSocketEmitter {
            requests: Some(requests),
            task: Some(task),
        })
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn subscribe(
        &self,
        topic: &TopicName,
        subscription: &str,
    ) -> BrokerResult<WebSocketReceiver> {
        let path = format!("/ws/v2/consumer/{}/{subscription}", topic.rest_path());
        let stream = self
            .open(&path, Some("subscriptionType=Exclusive"))
            .await
            .map_err(BrokerError::SubscribeFailed)?;

        Ok(WebSocketReceiver {
            stream,
            closed: false,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closed connection to {}", self.endpoint);
        }
    }
}

struct SendRequest {
    payload: Vec<u8>,
    completion: SendCompletion,
}

/// Producer socket, owned by a background task
///
/// The task writes each submitted payload tagged with a context id and
/// resolves the matching [`SendCompletion`] when the broker replies.
pub struct WebSocketEmitter {
    requests: Option<mpsc::UnboundedSender<SendRequest>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Emitter for WebSocketEmitter {
    fn send_async(&self, payload: Vec<u8>) -> PendingSend {
        let Some(requests) = &self.requests else {
            return PendingSend::failed(BrokerError::Closed);
        };

        let (completion, pending) = PendingSend::channel();
        if let Err(mpsc::error::SendError(request)) = requests.send(SendRequest {
            payload,
            completion,
        }) {
            request.completion.complete(Err(BrokerError::Closed));
        }

        pending
    }

    async fn close(&mut self) {
        // dropping the sender makes the producer task close the socket
        self.requests.take();

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("producer socket did not close in time");
                task.abort();
            }
        }
    }
}

async fn run_producer(stream: WsStream, mut requests: mpsc::UnboundedReceiver<SendRequest>) {
    let (mut sink, mut frames) = stream.split();
    let mut pending: HashMap<String, SendCompletion> = HashMap::new();
    let mut next_context: u64 = 0;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(SendRequest { payload, completion }) = request else {
                    break;
                };

                next_context += 1;
                let context = next_context.to_string();
                let frame = ProducerFrame {
                    payload: BASE64_STANDARD.encode(&payload),
                    context: context.clone(),
                };

                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        completion.complete(Err(BrokerError::SendFailed(e.to_string())));
                        continue;
                    }
                };

                match sink.send(Message::Text(text)).await {
                    Ok(()) => {
                        pending.insert(context, completion);
                    }
                    Err(e) => completion.complete(Err(BrokerError::SendFailed(e.to_string()))),
                }
            }

            frame = frames.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => resolve_reply(&mut pending, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("producer socket closed by broker");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("producer socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    for (_, completion) in pending.drain() {
        completion.complete(Err(BrokerError::Closed));
    }

    if let Err(e) = sink.close().await {
        trace!("error while closing producer socket: {e}");
    }
}

fn resolve_reply(pending: &mut HashMap<String, SendCompletion>, text: &str) {
    let reply: ProducerReply = match serde_json::from_str(text) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("unreadable producer reply: {e}");
            return;
        }
    };

    let Some(completion) = reply.context.as_ref().and_then(|ctx| pending.remove(ctx)) else {
        trace!("producer reply without pending send: {text}");
        return;
    };

    let result = match (reply.result.as_str(), reply.message_id) {
        ("ok", Some(id)) => Ok(MessageId(id)),
        ("ok", None) => Err(BrokerError::Protocol("ok reply without messageId".to_string())),
        (result, _) => Err(BrokerError::SendFailed(
            reply.error_msg.unwrap_or_else(|| result.to_string()),
        )),
    };

    completion.complete(result);
}

pub struct WebSocketReceiver {
    stream: WsStream,
    closed: bool,
}

impl WebSocketReceiver {
    async fn send_ack(&mut self, message_id: &str) -> BrokerResult<()> {
        let text = serde_json::to_string(&AckFrame { message_id })
            .map_err(|e| BrokerError::AckFailed(e.to_string()))?;

        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| BrokerError::AckFailed(e.to_string()))
    }
}

fn decode_message(text: &str) -> BrokerResult<ReceivedMessage> {
    let frame: ConsumerFrame =
        serde_json::from_str(text).map_err(|e| BrokerError::Protocol(e.to_string()))?;
    let payload = BASE64_STANDARD
        .decode(frame.payload)
        .map_err(|e| BrokerError::Protocol(format!("payload is not base64: {e}")))?;

    Ok(ReceivedMessage {
        id: MessageId(frame.message_id),
        payload,
    })
}

/// Message id of a consumer frame that did not decode, if it has one
fn frame_message_id(text: &str) -> Option<String> {
    let frame: serde_json::Value = serde_json::from_str(text).ok()?;
    frame
        .get("messageId")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Receiver for WebSocketReceiver {
    async fn receive(&mut self) -> BrokerResult<ReceivedMessage> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match decode_message(&text) {
                    Ok(message) => return Ok(message),
                    Err(e) => {
                        // ack it so the broker does not redeliver it forever
                        let Some(id) = frame_message_id(&text) else {
                            return Err(e);
                        };
                        warn!("skipping undecodable message {id}: {e}");
                        if let Err(e) = self.send_ack(&id).await {
                            warn!("failed to acknowledge {id}: {e}");
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(BrokerError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(BrokerError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn ack(&mut self, message: &ReceivedMessage) -> BrokerResult<()> {
        self.send_ack(&message.id.0).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.stream.close(None).await {
            trace!("error while closing consumer socket: {e}");
        }
    }
}
