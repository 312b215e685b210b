//! End-to-end: collector and forwarder working one queue file.
//!
//! The two processes are modelled as two independent `QueueStore`
//! connections on the same SQLite file, exactly as on the device. The central
//! store is the in-memory remote, so outages can be switched on and off.
//!
//! # Scenarios
//! 1. Readings sampled by the collector reach the remote store and end synced.
//! 2. During an outage the collector keeps appending; the backlog drains once
//!    the remote store is back.
//! 3. Both loops run concurrently and stop cleanly on shutdown.

use std::sync::Arc;
use std::time::Duration;
use telemetry_relay::collector::config::CollectorConfig;
use telemetry_relay::collector::producer::{Collected, Producer, ProducerSettings};
use telemetry_relay::collector::sensor::SimulatedSensor;
use telemetry_relay::forwarder::config::RelayConfig;
use telemetry_relay::forwarder::cycle::{Forwarder, ForwarderSettings, Step};
use telemetry_relay::forwarder::remote::DeviceInfo;
use telemetry_relay::forwarder::remote::memory::MemoryRemote;
use telemetry_relay::queue::QueueStore;
use tokio::sync::{Mutex, watch};

fn producer_on(path: &std::path::Path) -> Producer<SimulatedSensor> {
    let mut cfg = CollectorConfig::default();
    cfg.device_key = "edge-e2e".to_owned();
    Producer::new(
        QueueStore::open(path).unwrap(),
        SimulatedSensor::seeded("DHT22", "GPIO4", 0.0, 11),
        ProducerSettings::from_config(&cfg),
    )
}

fn forwarder_on(path: &std::path::Path, remote: &MemoryRemote) -> Forwarder<MemoryRemote> {
    let queue = Arc::new(Mutex::new(QueueStore::open(path).unwrap()));
    Forwarder::new(
        queue,
        Some(remote.clone()),
        DeviceInfo {
            device_key: "edge-e2e".to_owned(),
            location: Some("line 3".to_owned()),
            ip: None,
        },
        ForwarderSettings::from_config(&RelayConfig::default()),
    )
}

#[tokio::test(start_paused = true)]
async fn collected_readings_reach_the_remote_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let mut producer = producer_on(&path);
    let remote = MemoryRemote::new();
    let mut fwd = forwarder_on(&path, &remote);

    for _ in 0..5 {
        assert_eq!(producer.collect_once().await, Collected::Stored { ok: true });
    }
    assert!(matches!(fwd.step().await, Step::Delivered { sent: 5, .. }));

    let counts = QueueStore::open(&path).unwrap().counts().unwrap();
    assert_eq!(counts.synced, 5);
    assert_eq!(counts.pending, 0);
    assert_eq!(remote.reading_count(), 5);
    assert_eq!(remote.devices().len(), 1);
    assert_eq!(remote.devices()[0].location.as_deref(), Some("line 3"));
    assert_eq!(remote.sensors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn backlog_built_during_outage_drains_after_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let mut producer = producer_on(&path);
    let remote = MemoryRemote::new();
    let mut fwd = forwarder_on(&path, &remote);

    producer.collect_once().await;
    remote.set_offline(true);

    let Step::Failed { wait, .. } = fwd.step().await else {
        panic!("cycle must fail while the remote store is offline");
    };
    // The producer never waits on the forwarder.
    for _ in 0..3 {
        assert_eq!(producer.collect_once().await, Collected::Stored { ok: true });
    }
    assert_eq!(producer.queue().counts().unwrap().pending, 4);

    remote.set_offline(false);
    tokio::time::advance(wait).await;
    assert!(matches!(fwd.step().await, Step::Delivered { sent: 4, .. }));
    assert_eq!(remote.reading_count(), 4);
    assert_eq!(producer.queue().counts().unwrap().synced, 4);
}

#[tokio::test(start_paused = true)]
async fn both_loops_run_concurrently_and_stop_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let producer = producer_on(&path);
    let remote = MemoryRemote::new();
    let fwd = forwarder_on(&path, &remote);

    let (tx, rx) = watch::channel(false);
    let collector_task = tokio::spawn(producer.run(rx.clone()));
    let forwarder_task = tokio::spawn(fwd.run(rx));

    // Samples at 0, 10, .., 50; the forwarder cycle at 55 picks up the last one.
    tokio::time::sleep(Duration::from_secs(58)).await;
    tx.send(true).unwrap();
    collector_task.await.unwrap();
    forwarder_task.await.unwrap();

    let counts = QueueStore::open(&path).unwrap().counts().unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.synced, 6);
    assert_eq!(remote.reading_count(), 6);
}
