//! Produce-then-consume latency measurement
//!
//! ## State Machine
//!
//! ```text
//! Idle → Connecting → Sending → AwaitingEcho → Completed
//!            │            │           │
//!            └────────────┴───────────┴──────→ Failed
//! ```
//!
//! Sending and awaiting the echo run concurrently:
//!
//! ```text
//!  send-ack watcher ──(sent instant)──▶ receive task ──(latency)──▶ ┐
//!         │                                 │                      ├─▶ first wins
//!         └───────────(error)───────────────┴──────(error)───────▶ ┤
//!                                                 outer timeout ─▶ ┘
//! ```
//!
//! The receive task acknowledges every message it sees, drains unrelated
//! traffic and stops at the probe's own payload. Whatever wins, the receive
//! task is cancelled and awaited and the session is closed before `measure`
//! returns.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use crate::broker::{
    BrokerError, Connector, Credentials, Emitter, Endpoint, PendingSend, Receiver, TopicName,
};

use super::cache::ConnectionCache;
use super::error::ProbeError;
use super::session::ProbeSession;

/// How long the echo may take before the probe fails
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the receive task waits for the send acknowledgement after the echo arrived
pub const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Latency reported for a failed probe
pub const FAILED_LATENCY: Duration = Duration::from_secs(100);

pub const SUBSCRIPTION_NAME: &str = "latency-measure";

const PAYLOAD_PREFIX: &str = "measure-latency123";

/// Outcome of one probe: the measured latency or why there is none
pub type RoundTripResult = Result<Duration, ProbeError>;

/// Latency to report for `result`, [`FAILED_LATENCY`] when the probe failed
pub fn reported_latency(result: &RoundTripResult) -> Duration {
    match result {
        Ok(latency) => *latency,
        Err(_) => FAILED_LATENCY,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Connecting,
    Sending,
    AwaitingEcho,
    Completed,
    Failed,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeState::Idle => "idle",
            ProbeState::Connecting => "connecting",
            ProbeState::Sending => "sending",
            ProbeState::AwaitingEcho => "awaiting echo",
            ProbeState::Completed => "completed",
            ProbeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Timeout policy of the prober. Not configurable per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    pub echo: Duration,
    pub send_ack: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            echo: ECHO_TIMEOUT,
            send_ack: SEND_ACK_TIMEOUT,
        }
    }
}

/// Runs latency probes, borrowing connections from a shared cache
pub struct LatencyProber<C: Connector> {
    cache: Arc<ConnectionCache<C>>,
    timeouts: ProbeTimeouts,
    subscription: String,
}

impl<C: Connector> LatencyProber<C> {
    pub fn new(cache: Arc<ConnectionCache<C>>) -> Self {
        Self {
            cache,
            timeouts: ProbeTimeouts::default(),
            subscription: SUBSCRIPTION_NAME.to_string(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ProbeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    pub fn cache(&self) -> &Arc<ConnectionCache<C>> {
        &self.cache
    }

    pub fn timeouts(&self) -> ProbeTimeouts {
        self.timeouts
    }

    /// Measure one produce-then-consume round trip on `topic`
    ///
    /// Setup failures evict the endpoint's connection; every other failure
    /// leaves it cached.
    #[instrument(skip_all, fields(endpoint = %endpoint, topic = %topic))]
    pub async fn measure(
        &self,
        endpoint: &Endpoint,
        topic: &TopicName,
        credentials: &Credentials,
    ) -> RoundTripResult {
        trace!("probe {}", ProbeState::Connecting);

        let connection = match self.cache.acquire(endpoint, credentials).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("probe {}: {e}", ProbeState::Failed);
                return Err(ProbeError::Setup(e));
            }
        };

        let session = match ProbeSession::open(connection.as_ref(), topic, &self.subscription).await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("probe {}: {e}", ProbeState::Failed);
                // the connection must outlive the producer, which is already closed
                drop(connection);
                self.cache.evict(endpoint).await;
                return Err(e);
            }
        };

        let result = self.exchange(session).await;
        self.cache.release(connection).await;

        match &result {
            Ok(latency) => debug!("probe {} in {latency:?}", ProbeState::Completed),
            Err(e) => warn!("probe {}: {e}", ProbeState::Failed),
        }

        result
    }

    async fn exchange<E: Emitter, R: Receiver>(
        &self,
        session: ProbeSession<E, R>,
    ) -> RoundTripResult {
        let (mut emitter, mut receiver) = session.into_parts();
        let payload = probe_payload();

        let (sent_tx, sent_rx) = oneshot::channel::<Instant>();
        let (done_tx, done_rx) = oneshot::channel::<Duration>();
        let (error_tx, mut error_rx) = mpsc::channel::<ProbeError>(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let echo = EchoWait {
            expected: payload.clone().into_bytes(),
            sent_rx,
            done_tx,
            error_tx: error_tx.clone(),
            cancel: cancel_rx,
            send_ack_timeout: self.timeouts.send_ack,
        };
        let crash_tx = error_tx.clone();
        let receive_task = tokio::spawn(async move {
            // the receiver comes back even if the loop panics, so it is always closed
            if AssertUnwindSafe(echo.run(&mut receiver))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("receive loop panicked");
                let _ = crash_tx.try_send(ProbeError::Receive(BrokerError::ReceiveFailed(
                    "receive loop panicked".to_string(),
                )));
            }
            receiver
        });

        trace!("probe {}", ProbeState::Sending);
        let sent_at = Instant::now();
        let pending = emitter.send_async(payload.into_bytes());
        let ack_task = tokio::spawn(watch_send_ack(pending, sent_at, sent_tx, error_tx));

        trace!("probe {}", ProbeState::AwaitingEcho);
        let deadline = sent_at + self.timeouts.echo;
        let result = tokio::select! {
            biased;

            Ok(latency) = done_rx => {
                if latency < self.timeouts.echo {
                    Ok(latency)
                } else {
                    Err(ProbeError::Timeout { waited: self.timeouts.echo })
                }
            }
            Some(err) = error_rx.recv() => Err(err),
            _ = tokio::time::sleep_until(deadline) => {
                Err(ProbeError::Timeout { waited: self.timeouts.echo })
            }
        };

        // stop both helpers before tearing down the session
        let _ = cancel_tx.send(true);
        ack_task.abort();
        let _ = ack_task.await;

        match receive_task.await {
            Ok(mut receiver) => receiver.close().await,
            Err(e) => error!("receive task ended abnormally: {e}"),
        }
        emitter.close().await;

        result
    }
}

/// Unique payload for one round trip
fn probe_payload() -> String {
    format!(
        "{PAYLOAD_PREFIX}{}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

/// Publishes the send instant once the broker acknowledged the probe message
async fn watch_send_ack(
    pending: PendingSend,
    sent_at: Instant,
    sent_tx: oneshot::Sender<Instant>,
    error_tx: mpsc::Sender<ProbeError>,
) {
    match pending.acknowledged().await {
        Ok(id) => {
            debug!("probe message {id} acknowledged after {:?}", sent_at.elapsed());
            let _ = sent_tx.send(sent_at);
        }
        Err(e) => {
            warn!("probe message was not accepted: {e}");
            let _ = error_tx.try_send(ProbeError::Send(e));
        }
    }
}

/// State owned by the receive task
struct EchoWait {
    expected: Vec<u8>,
    sent_rx: oneshot::Receiver<Instant>,
    done_tx: oneshot::Sender<Duration>,
    error_tx: mpsc::Sender<ProbeError>,
    cancel: watch::Receiver<bool>,
    send_ack_timeout: Duration,
}

impl EchoWait {
    /// Receive until the probe payload shows up or the probe is cancelled
    async fn run<R: Receiver>(mut self, receiver: &mut R) {
        loop {
            if *self.cancel.borrow() {
                return;
            }

            let received = tokio::select! {
                _ = self.cancel.changed() => {
                    trace!("receive loop cancelled");
                    return;
                }
                received = receiver.receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    warn!("consumer receive error: {e}");
                    // only the first error matters to the probe
                    let _ = self.error_tx.try_send(ProbeError::Receive(e));
                    tokio::task::yield_now().await;
                    continue;
                }
            };

            if let Err(e) = receiver.ack(&message).await {
                warn!("failed to acknowledge {}: {e}", message.id);
            }

            if message.payload == self.expected {
                break;
            }

            debug!(
                "drained unrelated message {}: {}",
                message.id,
                String::from_utf8_lossy(&message.payload)
            );
        }

        tokio::select! {
            _ = self.cancel.changed() => {
                trace!("cancelled while waiting for the send acknowledgement");
            }
            sent = tokio::time::timeout(self.send_ack_timeout, self.sent_rx) => match sent {
                Ok(Ok(sent_at)) => {
                    let _ = self.done_tx.send(sent_at.elapsed());
                }
                // the send watcher has reported its own error
                Ok(Err(_)) => {}
                Err(_) => {
                    error!("probe message received, but its send was never acknowledged");
                    let _ = self.error_tx.try_send(ProbeError::MissingSendAck {
                        waited: self.send_ack_timeout,
                    });
                }
            }
        }
    }
}
