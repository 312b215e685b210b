//! In-memory remote store with fault injection.
//!
//! Enforces the same uniqueness rules as the real store and records every
//! write call, so tests can assert on call counts and idempotency.

use super::{DeviceInfo, RemoteError, RemoteReading, RemoteStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub id: i64,
    pub device_key: String,
    pub location: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRow {
    pub id: i64,
    pub device_id: i64,
    pub sensor_type: String,
    pub pin: String,
    pub label: String,
}

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<DeviceRow>,
    sensors: Vec<SensorRow>,
    readings: HashMap<Uuid, RemoteReading>,
    offline: bool,
    fail_next_writes: u32,
    rejected_ids: HashSet<Uuid>,
    write_calls: Vec<Vec<Uuid>>,
    resolve_calls: usize,
}

/// Cloning yields another handle onto the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens inside a failing test.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// While offline every operation fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `n` reading writes with a connection error.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_next_writes = n;
    }

    /// Any write containing `id` is rejected as a constraint violation.
    pub fn reject_reading(&self, id: Uuid) {
        self.lock().rejected_ids.insert(id);
    }

    pub fn accept_reading(&self, id: Uuid) {
        self.lock().rejected_ids.remove(&id);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn reading(&self, id: Uuid) -> Option<RemoteReading> {
        self.lock().readings.get(&id).cloned()
    }

    pub fn reading_count(&self) -> usize {
        self.lock().readings.len()
    }

    pub fn devices(&self) -> Vec<DeviceRow> {
        self.lock().devices.clone()
    }

    pub fn sensors(&self) -> Vec<SensorRow> {
        self.lock().sensors.clone()
    }

    /// Ids passed to each `upsert_readings` call, in call order.
    pub fn write_calls(&self) -> Vec<Vec<Uuid>> {
        self.lock().write_calls.clone()
    }

    /// Number of `ensure_device` + `ensure_sensor` calls.
    pub fn resolve_calls(&self) -> usize {
        self.lock().resolve_calls
    }

    pub fn reset_call_log(&self) {
        let mut inner = self.lock();
        inner.write_calls.clear();
        inner.resolve_calls = 0;
    }
}

impl RemoteStore for MemoryRemote {
    async fn ensure_device(&self, device: &DeviceInfo) -> Result<i64, RemoteError> {
        let mut inner = self.lock();
        inner.resolve_calls += 1;
        if inner.offline {
            return Err(RemoteError::Connection("connection refused".to_owned()));
        }
        if let Some(row) = inner
            .devices
            .iter_mut()
            .find(|d| d.device_key == device.device_key)
        {
            if device.location.is_some() {
                row.location.clone_from(&device.location);
            }
            if device.ip.is_some() {
                row.ip.clone_from(&device.ip);
            }
            return Ok(row.id);
        }
        let id = next_id(inner.devices.len());
        inner.devices.push(DeviceRow {
            id,
            device_key: device.device_key.clone(),
            location: device.location.clone(),
            ip: device.ip.clone(),
        });
        Ok(id)
    }

    async fn ensure_sensor(
        &self,
        device_id: i64,
        sensor_type: &str,
        pin: &str,
        label: &str,
    ) -> Result<i64, RemoteError> {
        let mut inner = self.lock();
        inner.resolve_calls += 1;
        if inner.offline {
            return Err(RemoteError::Connection("connection refused".to_owned()));
        }
        if !inner.devices.iter().any(|d| d.id == device_id) {
            return Err(RemoteError::Rejected(format!(
                "sensors.device_id {device_id} violates foreign key"
            )));
        }
        if let Some(row) = inner
            .sensors
            .iter()
            .find(|s| s.device_id == device_id && s.sensor_type == sensor_type && s.pin == pin)
        {
            return Ok(row.id);
        }
        let id = next_id(inner.sensors.len());
        inner.sensors.push(SensorRow {
            id,
            device_id,
            sensor_type: sensor_type.to_owned(),
            pin: pin.to_owned(),
            label: label.to_owned(),
        });
        Ok(id)
    }

    async fn upsert_readings(&self, rows: &[RemoteReading]) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.write_calls.push(rows.iter().map(|r| r.id).collect());
        if inner.offline {
            return Err(RemoteError::Connection("connection refused".to_owned()));
        }
        if inner.fail_next_writes > 0 {
            inner.fail_next_writes -= 1;
            return Err(RemoteError::Connection("server closed the connection".to_owned()));
        }
        for r in rows {
            if inner.rejected_ids.contains(&r.id) {
                return Err(RemoteError::Rejected(format!("reading {} violates a check constraint", r.id)));
            }
            if !inner.sensors.iter().any(|s| s.id == r.sensor_id) {
                return Err(RemoteError::Rejected(format!(
                    "readings.sensor_id {} violates foreign key",
                    r.sensor_id
                )));
            }
        }
        for r in rows {
            inner.readings.insert(r.id, r.clone());
        }
        Ok(())
    }
}

fn next_id(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX - 1) + 1
}
