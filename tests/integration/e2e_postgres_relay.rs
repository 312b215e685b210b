//! End-to-end: collector -> queue -> forwarder -> Postgres.
//!
//! Requires Docker. Uses the real migrations and the real upsert statements.
//!
//! # Scenarios
//! 1. Every sample arrives in Postgres; failed ones carry no values.
//! 2. Re-sending already delivered readings leaves one row per id.

use std::sync::Arc;
use telemetry_relay::collector::config::CollectorConfig;
use telemetry_relay::collector::producer::{Producer, ProducerSettings};
use telemetry_relay::collector::sensor::SimulatedSensor;
use telemetry_relay::forwarder::config::RelayConfig;
use telemetry_relay::forwarder::cycle::{Forwarder, ForwarderSettings, Step};
use telemetry_relay::forwarder::remote::postgres::PgRemote;
use telemetry_relay::forwarder::remote::{DeviceInfo, RemoteReading, RemoteStore};
use telemetry_relay::queue::QueueStore;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Mutex;

#[tokio::test]
async fn relay_delivers_into_postgres_idempotently() {
    let container = Postgres::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();

    let mut cfg = RelayConfig::default();
    cfg.device.key = "edge-pg".to_owned();
    cfg.remote.host = "127.0.0.1".to_owned();
    cfg.remote.port = port;
    cfg.remote.database = "postgres".to_owned();
    cfg.remote.user = "postgres".to_owned();
    cfg.remote.password = "postgres".to_owned();
    assert!(cfg.remote.is_ready());

    let remote = PgRemote::connect_lazy(&cfg.remote).unwrap();
    remote.run_migrations().await.unwrap();
    let pool = remote.pool().clone();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let mut collector_cfg = CollectorConfig::default();
    collector_cfg.device_key = "edge-pg".to_owned();
    let mut producer = Producer::new(
        QueueStore::open(&path).unwrap(),
        SimulatedSensor::seeded("DHT11", "GPIO4", 0.3, 21),
        ProducerSettings::from_config(&collector_cfg),
    );
    for _ in 0..12 {
        producer.collect_once().await;
    }

    let queue = Arc::new(Mutex::new(QueueStore::open(&path).unwrap()));
    let mut fwd = Forwarder::new(
        queue.clone(),
        Some(remote),
        DeviceInfo {
            device_key: "edge-pg".to_owned(),
            location: None,
            ip: Some("10.1.2.3".to_owned()),
        },
        ForwarderSettings::from_config(&cfg),
    );
    assert!(matches!(fwd.step().await, Step::Delivered { sent: 12, .. }));

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored, 12);

    assert_eq!(producer.queue().counts().unwrap().synced, 12);
    let failed_with_values: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM readings WHERE NOT ok AND (value_a IS NOT NULL OR error_text IS NULL)",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(failed_with_values, 0);

    // Replay every delivered reading once more through a second handle.
    let replay = PgRemote::from_pool(pool.clone());
    let device_id = replay
        .ensure_device(&DeviceInfo {
            device_key: "edge-pg".to_owned(),
            location: None,
            ip: None,
        })
        .await
        .unwrap();
    let sensor_id = replay
        .ensure_sensor(device_id, "DHT11", "GPIO4", "DHT11@GPIO4")
        .await
        .unwrap();
    let ids: Vec<uuid::Uuid> = sqlx::query_scalar("SELECT id FROM readings")
        .fetch_all(&pool)
        .await
        .unwrap();
    let rows: Vec<RemoteReading> = ids
        .iter()
        .map(|id| RemoteReading {
            id: *id,
            sensor_id,
            captured_at_epoch: 0,
            captured_at_text: "replayed".to_owned(),
            value_a: None,
            value_b: None,
            ok: false,
            error_text: None,
        })
        .collect();
    replay.upsert_readings(&rows).await.unwrap();

    let devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
        .fetch_one(&pool)
        .await
        .unwrap();
    let sensors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensors")
        .fetch_one(&pool)
        .await
        .unwrap();
    let readings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!((devices, sensors, readings), (1, 1, 12));

    let ip: Option<String> = sqlx::query_scalar("SELECT ip FROM devices")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(ip.as_deref(), Some("10.1.2.3"));
}
