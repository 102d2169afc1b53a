//! Latency probe engine
//!
//! One probe produces a unique message on a topic and times how long it takes
//! to come back on an exclusive subscription of the same topic.
//!
//! ## Resources
//!
//! ```text
//! ConnectionCache ── Arc<Connection> ──┐   (one per endpoint, reused across sweeps)
//!                                      ▼
//!                     ProbeSession { Emitter, Receiver }   (one per probe)
//! ```
//!
//! Sessions are closed consumer first, then producer. Connections are only
//! evicted on setup failures; timeouts and exchange errors keep them cached.

pub mod cache;
pub mod error;
pub mod protocol;
pub mod session;

pub use cache::ConnectionCache;
pub use error::ProbeError;
pub use protocol::{
    ECHO_TIMEOUT, FAILED_LATENCY, LatencyProber, ProbeState, ProbeTimeouts, RoundTripResult,
    SEND_ACK_TIMEOUT, SUBSCRIPTION_NAME, reported_latency,
};
pub use session::ProbeSession;
