//! Sensor acquisition seam.
//!
//! Hardware drivers live outside this crate; anything that can produce a
//! `Measurement` on demand plugs in through `Sensor`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_queue::Measurement;

pub trait Sensor: Send {
    fn sensor_type(&self) -> &str;
    fn pin(&self) -> &str;
    /// Take one sample. Acquisition failures are data, not errors.
    fn sample(&mut self) -> Measurement;
    /// Reinitialize after repeated failures.
    fn reset(&mut self) {}
}

const TEMP_RANGE: (f64, f64) = (-10.0, 50.0);
const HUMIDITY_RANGE: (f64, f64) = (5.0, 95.0);

/// Bounded random-walk temperature (°C) and relative humidity (%).
pub struct SimulatedSensor {
    sensor_type: String,
    pin: String,
    rng: StdRng,
    temperature: f64,
    humidity: f64,
    failure_ratio: f64,
    resets: u32,
}

impl SimulatedSensor {
    pub fn new(sensor_type: &str, pin: &str, failure_ratio: f64) -> Self {
        Self::with_rng(sensor_type, pin, failure_ratio, StdRng::from_entropy())
    }

    /// Deterministic sequence for tests.
    pub fn seeded(sensor_type: &str, pin: &str, failure_ratio: f64, seed: u64) -> Self {
        Self::with_rng(sensor_type, pin, failure_ratio, StdRng::seed_from_u64(seed))
    }

    fn with_rng(sensor_type: &str, pin: &str, failure_ratio: f64, rng: StdRng) -> Self {
        SimulatedSensor {
            sensor_type: sensor_type.to_owned(),
            pin: pin.to_owned(),
            rng,
            temperature: 22.0,
            humidity: 50.0,
            failure_ratio: failure_ratio.clamp(0.0, 1.0),
            resets: 0,
        }
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }
}

impl Sensor for SimulatedSensor {
    fn sensor_type(&self) -> &str {
        &self.sensor_type
    }

    fn pin(&self) -> &str {
        &self.pin
    }

    fn sample(&mut self) -> Measurement {
        if self.rng.gen_bool(self.failure_ratio) {
            return Measurement::Failed {
                error: "simulated checksum mismatch".to_owned(),
            };
        }
        self.temperature =
            (self.temperature + self.rng.gen_range(-0.5..=0.5)).clamp(TEMP_RANGE.0, TEMP_RANGE.1);
        self.humidity =
            (self.humidity + self.rng.gen_range(-1.0..=1.0)).clamp(HUMIDITY_RANGE.0, HUMIDITY_RANGE.1);
        Measurement::Ok {
            value_a: round1(self.temperature),
            value_b: round1(self.humidity),
        }
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
