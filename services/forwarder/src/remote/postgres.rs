//! Postgres-backed remote store.
//!
//! The pool connects lazily, so a forwarder started while the network is down
//! still runs and simply fails its delivery cycles until the store answers.

use super::{DeviceInfo, RemoteError, RemoteReading, RemoteStore};
use crate::config::RemoteConfig;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, QueryBuilder};

/// Bind parameters per row of the bulk reading upsert.
pub const BINDS_PER_READING: usize = 8;

/// Largest batch one upsert statement can carry within Postgres' bind limit.
pub const MAX_READINGS_PER_STATEMENT: usize = u16::MAX as usize / BINDS_PER_READING;

pub struct PgRemote {
    pool: PgPool,
}

impl PgRemote {
    /// Build a lazily-connecting pool from config. Fails only on bad settings.
    pub fn connect_lazy(cfg: &RemoteConfig) -> Result<Self, RemoteError> {
        let ssl_mode: PgSslMode = cfg
            .ssl_mode
            .parse()
            .map_err(|e: sqlx::Error| RemoteError::Other(format!("remote.ssl_mode: {e}")))?;
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .database(&cfg.database)
            .username(&cfg.user)
            .password(&cfg.password)
            .ssl_mode(ssl_mode);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(cfg.connect_timeout)
            .connect_lazy_with(options);
        Ok(PgRemote { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgRemote { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the devices/sensors/readings tables if they are missing.
    pub async fn run_migrations(&self) -> Result<(), RemoteError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RemoteError::Other(format!("migrations: {e}")))
    }
}

impl RemoteStore for PgRemote {
    async fn ensure_device(&self, device: &DeviceInfo) -> Result<i64, RemoteError> {
        sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO devices (device_key, location, ip) VALUES ($1, $2, $3)
               ON CONFLICT (device_key) DO UPDATE SET
                   location = COALESCE(EXCLUDED.location, devices.location),
                   ip = COALESCE(EXCLUDED.ip, devices.ip)
               RETURNING id"#,
        )
        .bind(&device.device_key)
        .bind(device.location.as_deref())
        .bind(device.ip.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn ensure_sensor(
        &self,
        device_id: i64,
        sensor_type: &str,
        pin: &str,
        label: &str,
    ) -> Result<i64, RemoteError> {
        sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO sensors (device_id, sensor_type, pin, label) VALUES ($1, $2, $3, $4)
               ON CONFLICT (device_id, sensor_type, pin) DO UPDATE SET
                   label = COALESCE(sensors.label, EXCLUDED.label)
               RETURNING id"#,
        )
        .bind(device_id)
        .bind(sensor_type)
        .bind(pin)
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn upsert_readings(&self, rows: &[RemoteReading]) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO readings \
             (id, sensor_id, captured_at_epoch, captured_at_text, value_a, value_b, ok, error_text) ",
        );
        qb.push_values(rows.iter(), |mut b, r| {
            b.push_bind(r.id)
                .push_bind(r.sensor_id)
                .push_bind(r.captured_at_epoch)
                .push_bind(r.captured_at_text.clone())
                .push_bind(r.value_a)
                .push_bind(r.value_b)
                .push_bind(r.ok)
                .push_bind(r.error_text.clone());
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
               sensor_id = EXCLUDED.sensor_id, \
               captured_at_epoch = EXCLUDED.captured_at_epoch, \
               captured_at_text = EXCLUDED.captured_at_text, \
               value_a = EXCLUDED.value_a, \
               value_b = EXCLUDED.value_b, \
               ok = EXCLUDED.ok, \
               error_text = EXCLUDED.error_text",
        );
        qb.build().execute(&self.pool).await.map_err(classify)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map a driver error onto the forwarder's retry taxonomy.
pub fn classify(err: sqlx::Error) -> RemoteError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => RemoteError::Connection(err.to_string()),
        sqlx::Error::Encode(_) => RemoteError::Rejected(err.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            classify_sqlstate(&code, err.to_string())
        }
        _ => RemoteError::Other(err.to_string()),
    }
}

/// Classify by Postgres SQLSTATE.
pub fn classify_sqlstate(code: &str, message: String) -> RemoteError {
    match code {
        "40001" | "40P01" | "55P03" => RemoteError::Connection(message),
        c if c.starts_with("08") || c.starts_with("53") || c.starts_with("57") => {
            RemoteError::Connection(message)
        }
        c if c.starts_with("22") || c.starts_with("23") => RemoteError::Rejected(message),
        _ => RemoteError::Other(message),
    }
}
