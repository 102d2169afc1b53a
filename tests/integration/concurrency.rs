//! Concurrent probes sharing the connection cache
//!
//! - Simultaneous probes against one endpoint build a single connection
//! - Eviction never closes a connection another probe still borrows

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use topic_latency_monitor::broker::memory::{Faults, MemoryBroker};
use topic_latency_monitor::broker::{Connection, Connector};
use topic_latency_monitor::probe::{ProbeError, SUBSCRIPTION_NAME};

use crate::helpers::*;

const URI: &str = "ws://shared:8080";

#[tokio::test]
async fn test_concurrent_probes_share_one_connection() {
    let broker = MemoryBroker::with_faults(Faults {
        delivery_delay: Duration::from_millis(20),
        ..Faults::default()
    });
    let prober = Arc::new(create_test_prober(&broker));

    let mut handles = Vec::new();
    for i in 0..8 {
        let prober = prober.clone();
        handles.push(tokio::spawn(async move {
            let topic = topic(&format!("persistent://t/ns/concurrent-{i}"));
            prober.measure(&endpoint(URI), &topic, &credentials()).await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let stats = broker.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.consumers_created, 8);
    assert_eq!(stats.consumers_closed, 8);
}

#[tokio::test]
async fn test_eviction_waits_for_borrowing_probe() {
    let broker = MemoryBroker::with_faults(Faults {
        delivery_delay: Duration::from_millis(150),
        ..Faults::default()
    });
    let prober = Arc::new(create_test_prober(&broker));

    let squatter = broker
        .connect(&endpoint("ws://elsewhere:8080"), &credentials())
        .await
        .unwrap();
    let _held = squatter
        .subscribe(&topic("persistent://t/ns/taken"), SUBSCRIPTION_NAME)
        .await
        .unwrap();

    let slow = {
        let prober = prober.clone();
        tokio::spawn(async move {
            prober
                .measure(&endpoint(URI), &topic("persistent://t/ns/slow"), &credentials())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let failed = prober
        .measure(&endpoint(URI), &topic("persistent://t/ns/taken"), &credentials())
        .await;
    assert_matches!(failed, Err(ProbeError::Setup(_)));

    // evicted, but the slow probe still holds it
    assert!(!prober.cache().contains(&endpoint(URI)).await);
    assert_eq!(broker.stats().connections_closed, 0);

    let latency = slow.await.unwrap().unwrap();
    assert!(latency >= Duration::from_millis(150));
    assert_eq!(broker.stats().connections_closed, 1);

    // the next probe builds a fresh connection
    prober
        .measure(&endpoint(URI), &topic("persistent://t/ns/slow"), &credentials())
        .await
        .unwrap();
    assert_eq!(broker.stats().connections_created, 3);
}
