//! Remote store contract.
//!
//! The central relational store owns three entities: devices (unique on
//! `device_key`), sensors (unique on `(device_id, sensor_type, pin)`) and
//! readings (unique on the reading `id`). Every write is an upsert so a
//! repeated call never creates a duplicate.

#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod postgres;

use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

/// Device attributes registered alongside its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_key: String,
    pub location: Option<String>,
    pub ip: Option<String>,
}

/// A reading as written to the remote store, keyed by the queue's reading id.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReading {
    pub id: Uuid,
    pub sensor_id: i64,
    pub captured_at_epoch: i64,
    pub captured_at_text: String,
    pub value_a: Option<f64>,
    pub value_b: Option<f64>,
    pub ok: bool,
    pub error_text: Option<String>,
}

/// Classified remote failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Connectivity loss or a server-side transient condition.
    #[error("remote connection: {0}")]
    Connection(String),
    /// The store refused the data itself (constraint violation, bad value).
    #[error("remote rejected data: {0}")]
    Rejected(String),
    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected(_))
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Connection(_) => "connection",
            RemoteError::Rejected(_) => "rejected",
            RemoteError::Other(_) => "other",
        }
    }
}

/// Idempotent find-or-create and upsert operations on the central store.
///
/// Implementations perform no retries of their own; errors are returned
/// classified and the forwarder decides what happens next.
pub trait RemoteStore: Send + Sync {
    /// Upsert the device row and return its id. Null attributes never erase
    /// stored ones.
    fn ensure_device(
        &self,
        device: &DeviceInfo,
    ) -> impl Future<Output = Result<i64, RemoteError>> + Send;

    /// Find or create the sensor row for `(device_id, sensor_type, pin)`.
    fn ensure_sensor(
        &self,
        device_id: i64,
        sensor_type: &str,
        pin: &str,
        label: &str,
    ) -> impl Future<Output = Result<i64, RemoteError>> + Send;

    /// Write all rows in one statement, overwriting rows whose id exists.
    /// Either every row is stored or none is.
    fn upsert_readings(
        &self,
        rows: &[RemoteReading],
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
