//! Connection reuse, eviction and session cleanup across successive probes

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use topic_latency_monitor::broker::memory::{Faults, MemoryBroker};
use topic_latency_monitor::broker::{Connection, Connector};
use topic_latency_monitor::probe::{ProbeError, SUBSCRIPTION_NAME};

use crate::helpers::*;

const URI: &str = "ws://pulsar.local:8080";
const TOPIC: &str = "persistent://tenant/ns/latency";

#[tokio::test]
async fn test_successive_probes_reuse_connection() {
    let broker = MemoryBroker::new();
    let prober = create_test_prober(&broker);

    for _ in 0..2 {
        let latency = prober
            .measure(&endpoint(URI), &topic(TOPIC), &credentials())
            .await
            .unwrap();
        assert!(latency < fast_timeouts().echo);
    }

    let stats = broker.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.connections_closed, 0);
    assert_eq!(stats.producers_created, 2);
    assert_eq!(stats.consumers_created, 2);
    assert_eq!(stats.producers_closed, 2);
    assert_eq!(stats.consumers_closed, 2);
    assert!(prober.cache().contains(&endpoint(URI)).await);
}

#[tokio::test]
async fn test_latency_reflects_delivery_delay() {
    let broker = MemoryBroker::with_faults(Faults {
        delivery_delay: Duration::from_millis(60),
        ..Faults::default()
    });
    let prober = create_test_prober(&broker);

    let latency = prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await
        .unwrap();

    assert!(latency >= Duration::from_millis(60));
    assert!(latency < fast_timeouts().echo);
}

#[tokio::test]
async fn test_producer_failure_evicts_connection() {
    let broker = MemoryBroker::with_faults(Faults {
        refuse_producers: true,
        ..Faults::default()
    });
    let prober = create_test_prober(&broker);

    let result = prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await;
    assert_matches!(result, Err(ProbeError::Setup(_)));
    assert!(!prober.cache().contains(&endpoint(URI)).await);
    assert_eq!(broker.stats().connections_closed, 1);

    broker.set_faults(Faults::default());
    prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await
        .unwrap();

    assert_eq!(broker.stats().connections_created, 2);
}

#[tokio::test]
async fn test_consumer_failure_closes_producer_and_evicts() {
    let broker = MemoryBroker::new();
    let prober = create_test_prober(&broker);

    // another exclusive consumer holds the subscription
    let squatter = broker
        .connect(&endpoint("ws://other:8080"), &credentials())
        .await
        .unwrap();
    let _held = squatter
        .subscribe(&topic(TOPIC), SUBSCRIPTION_NAME)
        .await
        .unwrap();

    let result = prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await;

    assert_matches!(result, Err(ProbeError::Setup(_)));
    let stats = broker.stats();
    assert_eq!(stats.producers_created, 1);
    assert_eq!(stats.producers_closed, 1);
    assert_eq!(stats.connections_closed, 1);
    assert!(!prober.cache().contains(&endpoint(URI)).await);
}

#[tokio::test]
async fn test_refused_connection_caches_nothing() {
    let broker = MemoryBroker::with_faults(Faults {
        refuse_connections: true,
        ..Faults::default()
    });
    let prober = create_test_prober(&broker);

    let result = prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await;

    assert_matches!(result, Err(ProbeError::Setup(_)));
    assert!(prober.cache().is_empty().await);
    assert_eq!(broker.stats().producers_created, 0);
}

#[tokio::test]
async fn test_timeout_keeps_connection_and_closes_session() {
    let broker = MemoryBroker::with_faults(Faults {
        drop_messages: true,
        ..Faults::default()
    });
    let prober = create_test_prober(&broker);

    let result = prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await;

    assert_matches!(result, Err(ProbeError::Timeout { .. }));
    assert!(prober.cache().contains(&endpoint(URI)).await);

    let stats = broker.stats();
    assert_eq!(stats.connections_closed, 0);
    assert_eq!(stats.producers_closed, stats.producers_created);
    assert_eq!(stats.consumers_closed, stats.consumers_created);
    assert_eq!(broker.consumer_count(&topic(TOPIC)), 0);
}

#[tokio::test]
async fn test_backlog_is_drained_and_acknowledged() {
    let broker = MemoryBroker::with_faults(Faults {
        backlog: vec![b"stale-1".to_vec(), b"stale-2".to_vec()],
        ..Faults::default()
    });
    let prober = create_test_prober(&broker);

    prober
        .measure(&endpoint(URI), &topic(TOPIC), &credentials())
        .await
        .unwrap();

    assert_eq!(broker.stats().messages_acked, 3);
}

#[tokio::test]
async fn test_close_all_closes_cached_connections() {
    let broker = MemoryBroker::new();
    let prober = create_test_prober(&broker);

    for uri in ["ws://a:8080", "ws://b:8080"] {
        prober
            .measure(&endpoint(uri), &topic(TOPIC), &credentials())
            .await
            .unwrap();
    }
    assert_eq!(prober.cache().len().await, 2);

    prober.cache().close_all().await;

    assert!(prober.cache().is_empty().await);
    assert_eq!(broker.stats().connections_closed, 2);
}
