//! Integration tests for the Postgres remote store.
//!
//! Requires Docker; each test starts its own Postgres container.
use chrono::{TimeZone, Utc};
use forwarder::config::{RelayConfig, RemoteConfig};
use forwarder::cycle::{Forwarder, ForwarderSettings, Step};
use forwarder::isolator;
use forwarder::remote::postgres::PgRemote;
use forwarder::remote::{DeviceInfo, RemoteReading, RemoteStore};
use relay_queue::{DeliveryState, Measurement, QueueStore, Reading, TimestampMode};
use std::sync::Arc;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Mutex;
use uuid::Uuid;

async fn test_remote() -> (ContainerAsync<Postgres>, PgRemote) {
    let container = Postgres::default().start().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();
    let cfg = RemoteConfig {
        host: "127.0.0.1".to_owned(),
        port,
        database: "postgres".to_owned(),
        user: "postgres".to_owned(),
        password: "postgres".to_owned(),
        ..RelayConfig::default().remote
    };
    let remote = PgRemote::connect_lazy(&cfg).unwrap();
    remote.run_migrations().await.unwrap();
    (container, remote)
}

fn device(key: &str, location: Option<&str>) -> DeviceInfo {
    DeviceInfo {
        device_key: key.to_owned(),
        location: location.map(str::to_owned),
        ip: None,
    }
}

fn row(sensor_id: i64, epoch: i64) -> RemoteReading {
    RemoteReading {
        id: Uuid::new_v4(),
        sensor_id,
        captured_at_epoch: epoch,
        captured_at_text: format!("t{epoch}"),
        value_a: Some(20.5),
        value_b: Some(48.0),
        ok: true,
        error_text: None,
    }
}

async fn count(remote: &PgRemote, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sqlx::AssertSqlSafe(format!("SELECT COUNT(*) FROM {table}")))
        .fetch_one(remote.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn ensure_device_and_sensor_never_duplicate() {
    let (_c, remote) = test_remote().await;

    let a = remote.ensure_device(&device("edge-1", Some("attic"))).await.unwrap();
    let b = remote.ensure_device(&device("edge-1", None)).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(count(&remote, "devices").await, 1);

    let location: Option<String> =
        sqlx::query_scalar("SELECT location FROM devices WHERE id = $1")
            .bind(a)
            .fetch_one(remote.pool())
            .await
            .unwrap();
    assert_eq!(location.as_deref(), Some("attic"));

    let s1 = remote.ensure_sensor(a, "DHT22", "GPIO4", "DHT22@GPIO4").await.unwrap();
    let s2 = remote.ensure_sensor(a, "DHT22", "GPIO4", "other").await.unwrap();
    let s3 = remote.ensure_sensor(a, "DHT22", "GPIO17", "DHT22@GPIO17").await.unwrap();
    assert_eq!(s1, s2);
    assert_ne!(s1, s3);
    assert_eq!(count(&remote, "sensors").await, 2);
}

#[tokio::test]
async fn concurrent_ensure_device_yields_one_row() {
    let (_c, remote) = test_remote().await;
    let remote = Arc::new(remote);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let r = remote.clone();
        handles.push(tokio::spawn(async move {
            r.ensure_device(&device("edge-race", None)).await.unwrap()
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(count(&remote, "devices").await, 1);
}

#[tokio::test]
async fn resending_a_reading_overwrites_instead_of_duplicating() {
    let (_c, remote) = test_remote().await;
    let dev = remote.ensure_device(&device("edge-1", None)).await.unwrap();
    let sensor = remote.ensure_sensor(dev, "DHT11", "GPIO4", "DHT11@GPIO4").await.unwrap();

    let mut r = row(sensor, 100);
    remote.upsert_readings(&[r.clone()]).await.unwrap();
    remote.upsert_readings(&[r.clone()]).await.unwrap();
    assert_eq!(count(&remote, "readings").await, 1);

    r.value_a = Some(99.0);
    remote.upsert_readings(&[r.clone()]).await.unwrap();
    let stored: Option<f64> = sqlx::query_scalar("SELECT value_a FROM readings WHERE id = $1")
        .bind(r.id)
        .fetch_one(remote.pool())
        .await
        .unwrap();
    assert_eq!(stored, Some(99.0));
    assert_eq!(count(&remote, "readings").await, 1);
}

#[tokio::test]
async fn constraint_violation_is_classified_as_rejection() {
    let (_c, remote) = test_remote().await;
    let err = remote.upsert_readings(&[row(424_242, 1)]).await.unwrap_err();
    assert!(err.is_rejection(), "expected rejection, got {err:?}");
}

#[tokio::test]
async fn isolator_stores_healthy_rows_around_a_bad_one() {
    let (_c, remote) = test_remote().await;
    let dev = remote.ensure_device(&device("edge-1", None)).await.unwrap();
    let sensor = remote.ensure_sensor(dev, "DHT11", "GPIO4", "DHT11@GPIO4").await.unwrap();

    let mut rows: Vec<RemoteReading> = (0..8).map(|i| row(sensor, i)).collect();
    rows[6].sensor_id = 999_999;
    let report = isolator::deliver(&remote, &rows).await.unwrap();

    assert_eq!(report.delivered.len(), 7);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, rows[6].id);
    assert!(report.rejected_calls <= 4);
    assert_eq!(count(&remote, "readings").await, 7);
}

#[tokio::test]
async fn forwarder_cycle_delivers_queue_to_postgres() {
    let (_c, remote) = test_remote().await;
    let mut q = QueueStore::open_in_memory().unwrap();
    let mut ids = Vec::new();
    for epoch in [30, 10, 20] {
        let r = Reading::captured_at(
            "edge-pg",
            "DHT22",
            "GPIO4",
            Measurement::Ok {
                value_a: 22.0,
                value_b: 45.0,
            },
            TimestampMode::Utc,
            Utc.timestamp_opt(epoch, 0).unwrap(),
        );
        ids.push(r.id);
        q.append(&r).unwrap();
    }
    q.append(&Reading::new(
        "edge-pg",
        "DHT22",
        "GPIO4",
        Measurement::Failed {
            error: "checksum mismatch".to_owned(),
        },
        TimestampMode::Utc,
    ))
    .unwrap();
    let queue = Arc::new(Mutex::new(q));

    let mut fwd = Forwarder::new(
        queue.clone(),
        Some(remote),
        device("edge-pg", Some("shed")),
        ForwarderSettings::from_config(&RelayConfig::default()),
    );
    assert!(matches!(fwd.step().await, Step::Delivered { sent: 4, .. }));
    for id in &ids {
        let state = queue.lock().await.get(*id).unwrap().unwrap().delivery_state;
        assert_eq!(state, DeliveryState::Synced);
    }
}
