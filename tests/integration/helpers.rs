//! Test helpers shared by the integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use topic_latency_monitor::{
    alerts::IncidentReporter,
    broker::{Credentials, Endpoint, TopicName, memory::MemoryBroker},
    config::{Config, parse_config},
    probe::{ConnectionCache, LatencyProber, ProbeTimeouts},
};

/// Timeouts short enough to keep failing probes fast
pub fn fast_timeouts() -> ProbeTimeouts {
    ProbeTimeouts {
        echo: Duration::from_millis(300),
        send_ack: Duration::from_millis(100),
    }
}

pub fn create_test_prober(broker: &MemoryBroker) -> LatencyProber<MemoryBroker> {
    let cache = Arc::new(ConnectionCache::new(broker.clone()));
    LatencyProber::new(cache).with_timeouts(fast_timeouts())
}

pub fn endpoint(uri: &str) -> Endpoint {
    Endpoint::parse(uri).unwrap()
}

pub fn topic(name: &str) -> TopicName {
    TopicName::parse(name).unwrap()
}

pub fn credentials() -> Credentials {
    Credentials::new(Some("test-token".to_string()), None)
}

pub fn create_test_config(topics: &str) -> Config {
    parse_config(
        &format!(r#"{{ "name": "test-monitor", "token": "test-token", "topics": [{topics}] }}"#),
        None,
    )
    .unwrap()
}

/// Remembers every incident it is handed
#[derive(Clone, Default)]
pub struct RecordingReporter {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl IncidentReporter for RecordingReporter {
    async fn report_incident(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
