//! Remote upsert gateway.
//!
//! Resolves every queued reading to a remote sensor id, then hands the
//! converted rows to the isolator for the bulk write. Device and sensor ids are
//! cached only for the duration of one `deliver_batch` call, so each distinct
//! sensor costs at most one resolution round trip per cycle.

use crate::isolator::{self, IsolationReport};
use crate::remote::{DeviceInfo, RemoteError, RemoteReading, RemoteStore};
use relay_queue::QueuedReading;
use std::collections::HashMap;

pub struct UpsertGateway<'a, R> {
    remote: &'a R,
    /// Identity registered for this edge device. Readings carrying another
    /// device key are registered by key alone.
    identity: &'a DeviceInfo,
}

impl<'a, R: RemoteStore> UpsertGateway<'a, R> {
    pub fn new(remote: &'a R, identity: &'a DeviceInfo) -> Self {
        UpsertGateway { remote, identity }
    }

    /// Resolve and write `batch`. Any resolution error fails the whole batch.
    pub async fn deliver_batch(
        &self,
        batch: &[QueuedReading],
    ) -> Result<IsolationReport, RemoteError> {
        let rows = self.resolve(batch).await?;
        isolator::deliver(self.remote, &rows).await
    }

    async fn resolve(&self, batch: &[QueuedReading]) -> Result<Vec<RemoteReading>, RemoteError> {
        let mut devices: HashMap<&str, i64> = HashMap::new();
        let mut sensors: HashMap<(i64, &str, &str), i64> = HashMap::new();
        let mut rows = Vec::with_capacity(batch.len());

        for queued in batch {
            let r = &queued.reading;
            let device_id = match devices.get(r.device_key.as_str()) {
                Some(id) => *id,
                None => {
                    let id = self.remote.ensure_device(&self.device_info(&r.device_key)).await?;
                    devices.insert(&r.device_key, id);
                    id
                }
            };

            let key = (device_id, r.sensor_type.as_str(), r.pin.as_str());
            let sensor_id = match sensors.get(&key) {
                Some(id) => *id,
                None => {
                    let id = self
                        .remote
                        .ensure_sensor(device_id, &r.sensor_type, &r.pin, &sensor_label(&r.sensor_type, &r.pin))
                        .await?;
                    sensors.insert(key, id);
                    id
                }
            };

            rows.push(RemoteReading {
                id: r.id,
                sensor_id,
                captured_at_epoch: r.captured_at_epoch,
                captured_at_text: r.captured_at_text.clone(),
                value_a: r.value_a,
                value_b: r.value_b,
                ok: r.ok,
                error_text: r.error_text.clone(),
            });
        }

        tracing::debug!(
            rows = rows.len(),
            devices = devices.len(),
            sensors = sensors.len(),
            "batch resolved"
        );
        Ok(rows)
    }

    fn device_info(&self, device_key: &str) -> DeviceInfo {
        if device_key == self.identity.device_key {
            self.identity.clone()
        } else {
            DeviceInfo {
                device_key: device_key.to_owned(),
                location: None,
                ip: None,
            }
        }
    }
}

pub fn sensor_label(sensor_type: &str, pin: &str) -> String {
    format!("{sensor_type}@{pin}")
}
