//! Failure causes of a single latency probe

use std::fmt;
use std::time::Duration;

use crate::broker::BrokerError;

/// Why a round trip did not produce a latency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Connection, producer or consumer could not be established.
    ///
    /// The only class that evicts the cached connection.
    Setup(BrokerError),

    /// The consumer failed while waiting for the echo
    Receive(BrokerError),

    /// The broker rejected the probe message
    Send(BrokerError),

    /// The echo arrived but the send acknowledgement never did
    MissingSendAck { waited: Duration },

    /// No echo arrived in time
    Timeout { waited: Duration },
}

impl ProbeError {
    pub fn is_setup(&self) -> bool {
        matches!(self, ProbeError::Setup(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout { .. })
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Setup(err) => write!(f, "setup error: {}", err),
            ProbeError::Receive(err) => write!(f, "{}", err),
            ProbeError::Send(err) => write!(f, "{}", err),
            ProbeError::MissingSendAck { waited } => write!(
                f,
                "consumer received the probe message, but the send was not acknowledged within {:?}",
                waited
            ),
            ProbeError::Timeout { waited } => {
                write!(f, "latency measure not received after {:?}", waited)
            }
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Setup(err) | ProbeError::Receive(err) | ProbeError::Send(err) => Some(err),
            _ => None,
        }
    }
}
