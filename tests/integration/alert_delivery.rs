//! Sweeps delivering incidents to real HTTP sinks

use serde_json::json;
use topic_latency_monitor::alerts::AlertManager;
use topic_latency_monitor::broker::memory::{Faults, MemoryBroker};
use topic_latency_monitor::config::{Alert, Discord, Webhook};
use topic_latency_monitor::sweep::SweepDriver;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_failed_cluster_reaches_every_sink() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(body_partial_json(json!({ "monitor": "test-monitor" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/discord"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let broker = MemoryBroker::with_faults(Faults {
        refuse_connections: true,
        ..Faults::default()
    });
    let alerts = AlertManager::new(
        "test-monitor",
        vec![
            Alert::Webhook(Webhook {
                url: format!("{}/webhook", mock_server.uri()),
            }),
            Alert::Discord(Discord {
                url: format!("{}/discord", mock_server.uri()),
                user_id: None,
            }),
        ],
    );
    let driver = SweepDriver::new(create_test_prober(&broker), alerts);
    let config = create_test_config(
        r#"{ "name": "down", "pulsarUrl": "ws://down:8080", "topicName": "persistent://t/ns/latency" }"#,
    );

    let reports = driver.run_sweep(&config).await;
    assert!(!reports[0].is_healthy());
}

#[tokio::test]
async fn test_healthy_sweep_sends_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let broker = MemoryBroker::new();
    let alerts = AlertManager::new(
        "test-monitor",
        vec![Alert::Webhook(Webhook {
            url: mock_server.uri(),
        })],
    );
    let driver = SweepDriver::new(create_test_prober(&broker), alerts);
    let config = create_test_config(
        r#"{ "name": "up", "pulsarUrl": "ws://up:8080", "topicName": "persistent://t/ns/latency" }"#,
    );

    let reports = driver.run_sweep(&config).await;
    assert!(reports[0].is_healthy());
}
