//! End-to-end sweeps over the in-memory broker

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use topic_latency_monitor::broker::{Connection, Connector};
use topic_latency_monitor::broker::memory::{Faults, MemoryBroker};
use topic_latency_monitor::probe::{FAILED_LATENCY, ProbeError, SUBSCRIPTION_NAME};
use topic_latency_monitor::sweep::{SweepDriver, Verdict};

use crate::helpers::*;

#[tokio::test]
async fn test_healthy_cluster_within_default_budget() {
    let broker = MemoryBroker::new();
    let driver = SweepDriver::new(create_test_prober(&broker), RecordingReporter::default());
    let config = create_test_config(
        r#"{ "name": "useast", "pulsarUrl": "ws://useast:8080", "topicName": "persistent://t/ns/latency" }"#,
    );

    let reports = driver.run_sweep(&config).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].verdict, Verdict::WithinBudget);
    assert_eq!(reports[0].budget, Duration::from_millis(2400));
    assert!(driver.reporter().messages().is_empty());
}

#[tokio::test]
async fn test_slow_cluster_is_reported_once_with_both_values() {
    let broker = MemoryBroker::with_faults(Faults {
        delivery_delay: Duration::from_millis(40),
        ..Faults::default()
    });
    let driver = SweepDriver::new(create_test_prober(&broker), RecordingReporter::default());
    let config = create_test_config(
        r#"{ "name": "slow", "pulsarUrl": "ws://slow:8080", "topicName": "persistent://t/ns/latency", "latencyBudgetMs": 10 }"#,
    );

    let reports = driver.run_sweep(&config).await;

    assert_eq!(reports[0].verdict, Verdict::OverBudget);
    let messages = driver.reporter().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0],
        format!(
            "cluster slow latency {:?} over budget {:?}",
            reports[0].latency,
            Duration::from_millis(10)
        )
    );
}

#[tokio::test]
async fn test_subscribe_failure_is_reported_and_sweep_continues() {
    let broker = MemoryBroker::new();
    let driver = SweepDriver::new(create_test_prober(&broker), RecordingReporter::default());
    let config = create_test_config(
        r#"{ "name": "a", "pulsarUrl": "ws://a:8080", "topicName": "persistent://t/ns/taken" },
           { "name": "b", "pulsarUrl": "ws://b:8080", "topicName": "persistent://t/ns/free" }"#,
    );

    let squatter = broker
        .connect(&endpoint("ws://elsewhere:8080"), &credentials())
        .await
        .unwrap();
    let _held = squatter
        .subscribe(&topic("persistent://t/ns/taken"), SUBSCRIPTION_NAME)
        .await
        .unwrap();

    let reports = driver.run_sweep(&config).await;

    assert_matches!(&reports[0].verdict, Verdict::ProbeFailed(ProbeError::Setup(_)));
    assert_eq!(reports[0].latency, FAILED_LATENCY);
    assert_eq!(reports[1].verdict, Verdict::WithinBudget);

    let prober = driver.prober();
    assert!(!prober.cache().contains(&endpoint("ws://a:8080")).await);
    assert!(prober.cache().contains(&endpoint("ws://b:8080")).await);

    let messages = driver.reporter().messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("cluster a probe error: setup error"));
}

#[tokio::test]
async fn test_missing_echo_times_out_without_eviction() {
    let broker = MemoryBroker::with_faults(Faults {
        drop_messages: true,
        ..Faults::default()
    });
    let driver = SweepDriver::new(create_test_prober(&broker), RecordingReporter::default());
    let config = create_test_config(
        r#"{ "name": "quiet", "pulsarUrl": "ws://quiet:8080", "topicName": "persistent://t/ns/latency" }"#,
    );

    let reports = driver.run_sweep(&config).await;

    assert_matches!(&reports[0].verdict, Verdict::ProbeFailed(e) if e.is_timeout());
    assert_eq!(reports[0].latency, FAILED_LATENCY);
    assert!(driver.prober().cache().contains(&endpoint("ws://quiet:8080")).await);
    assert_eq!(broker.stats().connections_closed, 0);

    let messages = driver.reporter().messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("cluster quiet probe error: latency measure not received"));
}

#[tokio::test]
async fn test_connection_survives_across_sweeps() {
    let broker = MemoryBroker::new();
    let driver = SweepDriver::new(create_test_prober(&broker), RecordingReporter::default());
    let config = create_test_config(
        r#"{ "pulsarUrl": "ws://a:8080", "topicName": "persistent://t/ns/one" },
           { "pulsarUrl": "ws://a:8080", "topicName": "persistent://t/ns/two" }"#,
    );

    for _ in 0..3 {
        let reports = driver.run_sweep(&config).await;
        assert!(reports.iter().all(|report| report.is_healthy()));
    }

    let stats = broker.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.producers_created, 6);
    assert_eq!(stats.consumers_closed, 6);
}

#[tokio::test]
async fn test_recovery_after_setup_failure() {
    let broker = MemoryBroker::with_faults(Faults {
        refuse_producers: true,
        ..Faults::default()
    });
    let driver = SweepDriver::new(create_test_prober(&broker), RecordingReporter::default());
    let config = create_test_config(
        r#"{ "name": "flaky", "pulsarUrl": "ws://flaky:8080", "topicName": "persistent://t/ns/latency" }"#,
    );

    let first = driver.run_sweep(&config).await;
    assert!(!first[0].is_healthy());

    broker.set_faults(Faults::default());
    let second = driver.run_sweep(&config).await;
    assert!(second[0].is_healthy());

    assert_eq!(broker.stats().connections_created, 2);
    assert_eq!(driver.reporter().messages().len(), 1);
}
