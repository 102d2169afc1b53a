//! Producer/consumer pair for a single round trip

use tracing::{debug, warn};

use crate::broker::{Connection, Emitter, Receiver, TopicName};

use super::error::ProbeError;

/// Producer and exclusive consumer opened on one topic for one probe
///
/// Never cached and never shared; the probe closes it before returning.
pub struct ProbeSession<E: Emitter, R: Receiver> {
    emitter: E,
    receiver: R,
}

impl<E: Emitter, R: Receiver> ProbeSession<E, R> {
    /// Open the producer, then the consumer
    ///
    /// If subscribing fails the producer is closed before the error is
    /// returned, so the caller may tear down the connection right away.
    pub async fn open<T>(
        connection: &T,
        topic: &TopicName,
        subscription: &str,
    ) -> Result<Self, ProbeError>
    where
        T: Connection<Emitter = E, Receiver = R>,
    {
        let mut emitter = connection
            .create_emitter(topic)
            .await
            .map_err(ProbeError::Setup)?;

        let receiver = match connection.subscribe(topic, subscription).await {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("subscribing to {topic} failed, closing producer: {e}");
                emitter.close().await;
                return Err(ProbeError::Setup(e));
            }
        };

        debug!("opened probe session on {topic} ({subscription})");

        Ok(Self { emitter, receiver })
    }

    pub fn into_parts(self) -> (E, R) {
        (self.emitter, self.receiver)
    }

    /// Close consumer first, then producer
    pub async fn close(self) {
        let (mut emitter, mut receiver) = self.into_parts();
        receiver.close().await;
        emitter.close().await;
    }
}
