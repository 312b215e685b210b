//! Producer loop: sample, append, sleep.
//!
//! Every sample becomes a queued reading, failed acquisitions included. The
//! producer only ever appends; delivery is the forwarder's business.

use crate::config::CollectorConfig;
use crate::sensor::Sensor;
use relay_queue::{Measurement, QueueStore, Reading, TimestampMode};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub device_key: String,
    pub timestamp_mode: TimestampMode,
    pub read_interval: Duration,
    pub retry_interval: Duration,
    pub lock_retry: Duration,
    pub max_consecutive_errors: u32,
}

impl ProducerSettings {
    pub fn from_config(cfg: &CollectorConfig) -> Self {
        ProducerSettings {
            device_key: cfg.device_key.clone(),
            timestamp_mode: cfg.timestamp_mode,
            read_interval: cfg.read_interval,
            retry_interval: cfg.retry_interval,
            lock_retry: cfg.lock_retry,
            max_consecutive_errors: cfg.max_consecutive_errors,
        }
    }
}

/// What happened to one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collected {
    /// Appended to the queue; `ok` mirrors the measurement outcome.
    Stored { ok: bool },
    /// The queue refused the append, even after the retry.
    Dropped,
}

impl Collected {
    pub fn pause(self, settings: &ProducerSettings) -> Duration {
        match self {
            Collected::Stored { ok: true } => settings.read_interval,
            Collected::Stored { ok: false } | Collected::Dropped => settings.retry_interval,
        }
    }
}

pub struct Producer<S> {
    queue: QueueStore,
    sensor: S,
    settings: ProducerSettings,
    consecutive_errors: u32,
}

impl<S: Sensor> Producer<S> {
    pub fn new(queue: QueueStore, sensor: S, settings: ProducerSettings) -> Self {
        Producer {
            queue,
            sensor,
            settings,
            consecutive_errors: 0,
        }
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device_key = %self.settings.device_key,
            sensor_type = %self.sensor.sensor_type(),
            pin = %self.sensor.pin(),
            interval_secs = self.settings.read_interval.as_secs_f64(),
            "collector loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = self.collect_once().await.pause(&self.settings);
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("collector loop stopped");
    }

    /// Sample once and append the reading.
    pub async fn collect_once(&mut self) -> Collected {
        let measurement = self.sensor.sample();
        let ok = matches!(measurement, Measurement::Ok { .. });
        if let Measurement::Failed { error } = &measurement {
            warn!(error = %error, "sensor read failed");
        }
        let reading = Reading::new(
            &self.settings.device_key,
            self.sensor.sensor_type(),
            self.sensor.pin(),
            measurement,
            self.settings.timestamp_mode,
        );

        let outcome = match self.append(&reading).await {
            Ok(()) => Collected::Stored { ok },
            Err(e) => {
                error!(reading_id = %reading.id, error = %e, "reading dropped");
                Collected::Dropped
            }
        };

        self.track_errors(ok);
        outcome
    }

    async fn append(&mut self, reading: &Reading) -> Result<(), relay_queue::QueueError> {
        match self.queue.append(reading) {
            Err(e) if e.is_transient() => {
                warn!(
                    error = %e,
                    retry_in_secs = self.settings.lock_retry.as_secs_f64(),
                    "queue busy, retrying append once"
                );
                tokio::time::sleep(self.settings.lock_retry).await;
                self.queue.append(reading)
            }
            other => other,
        }
    }

    fn track_errors(&mut self, ok: bool) {
        if ok {
            self.consecutive_errors = 0;
            return;
        }
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.settings.max_consecutive_errors {
            warn!(failures = self.consecutive_errors, "too many failed reads, resetting sensor");
            self.sensor.reset();
            self.consecutive_errors = 0;
        }
    }
}
