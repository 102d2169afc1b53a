//! Error types for broker client operations

use std::fmt;

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by a broker client (connection, producer or consumer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The endpoint URI could not be used to reach a broker
    InvalidEndpoint(String),

    /// The topic name is malformed
    InvalidTopic(String),

    /// Creating the client connection failed (bad URI, trust store, ...)
    ConnectionFailed(String),

    /// Opening a producer on the topic failed
    ProducerFailed(String),

    /// Subscribing a consumer to the topic failed
    SubscribeFailed(String),

    /// The broker rejected or never acknowledged a send
    SendFailed(String),

    /// A blocking receive failed
    ReceiveFailed(String),

    /// Acknowledging a received message failed
    AckFailed(String),

    /// The broker sent a frame we could not make sense of
    Protocol(String),

    /// The producer, consumer or connection has already been closed
    Closed,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::InvalidEndpoint(msg) => write!(f, "invalid broker endpoint: {}", msg),
            BrokerError::InvalidTopic(msg) => write!(f, "invalid topic name: {}", msg),
            BrokerError::ConnectionFailed(msg) => {
                write!(f, "failed to create broker connection: {}", msg)
            }
            BrokerError::ProducerFailed(msg) => write!(f, "failed to create producer: {}", msg),
            BrokerError::SubscribeFailed(msg) => write!(f, "failed to subscribe: {}", msg),
            BrokerError::SendFailed(msg) => write!(f, "failed to send message: {}", msg),
            BrokerError::ReceiveFailed(msg) => write!(f, "consumer receive error: {}", msg),
            BrokerError::AckFailed(msg) => write!(f, "failed to acknowledge message: {}", msg),
            BrokerError::Protocol(msg) => write!(f, "unexpected broker frame: {}", msg),
            BrokerError::Closed => write!(f, "broker handle already closed"),
        }
    }
}

impl std::error::Error for BrokerError {}
