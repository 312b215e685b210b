//! Reading data model.
//!
//! A `Reading` is immutable once created: the producer fills in identity,
//! capture time and values, and only the delivery bookkeeping around it
//! (`DeliveryState`, attempts) changes afterwards.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const CAPTURED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ---------------------------------------------------------------------------
// DeliveryState
// ---------------------------------------------------------------------------

/// Delivery classification of a queued reading.
///
/// Only `Pending -> Synced` and `Pending -> Dead` exist; both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Synced,
    Dead,
}

impl DeliveryState {
    pub fn as_i64(self) -> i64 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Synced => 1,
            DeliveryState::Dead => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(DeliveryState::Pending),
            1 => Some(DeliveryState::Synced),
            2 => Some(DeliveryState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Synced => "synced",
            DeliveryState::Dead => "dead",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TimestampMode
// ---------------------------------------------------------------------------

/// Time zone used for the human-readable `captured_at_text`.
///
/// The epoch is always UTC; this only affects the text column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    #[default]
    Utc,
    Local,
}

impl FromStr for TimestampMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utc" => Ok(TimestampMode::Utc),
            "local" => Ok(TimestampMode::Local),
            other => Err(format!("unknown timestamp mode '{other}' (expected utc|local)")),
        }
    }
}

impl TimestampMode {
    pub fn format(self, at: DateTime<Utc>) -> String {
        match self {
            TimestampMode::Utc => at.format(CAPTURED_AT_FORMAT).to_string(),
            TimestampMode::Local => at
                .with_timezone(&Local)
                .format(CAPTURED_AT_FORMAT)
                .to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Measurement / Reading
// ---------------------------------------------------------------------------

/// Outcome of one acquisition attempt, as handed over by the sensor layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Ok { value_a: f64, value_b: f64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: Uuid,
    pub device_key: String,
    pub sensor_type: String,
    pub pin: String,
    pub captured_at_epoch: i64,
    pub captured_at_text: String,
    pub value_a: Option<f64>,
    pub value_b: Option<f64>,
    pub ok: bool,
    pub error_text: Option<String>,
}

impl Reading {
    /// Build a reading captured now, with a fresh UUID v4 id.
    pub fn new(
        device_key: &str,
        sensor_type: &str,
        pin: &str,
        measurement: Measurement,
        mode: TimestampMode,
    ) -> Self {
        Self::captured_at(device_key, sensor_type, pin, measurement, mode, Utc::now())
    }

    pub fn captured_at(
        device_key: &str,
        sensor_type: &str,
        pin: &str,
        measurement: Measurement,
        mode: TimestampMode,
        at: DateTime<Utc>,
    ) -> Self {
        let (value_a, value_b, ok, error_text) = match measurement {
            Measurement::Ok { value_a, value_b } => (Some(value_a), Some(value_b), true, None),
            Measurement::Failed { error } => (None, None, false, Some(error)),
        };
        Reading {
            id: Uuid::new_v4(),
            device_key: device_key.to_owned(),
            sensor_type: sensor_type.to_owned(),
            pin: pin.to_owned(),
            captured_at_epoch: at.timestamp(),
            captured_at_text: mode.format(at),
            value_a,
            value_b,
            ok,
            error_text,
        }
    }
}

/// Normalize a board pin name to the `GPIO<n>` form used in the remote store.
///
/// `D4` becomes `GPIO4`; names already prefixed with `GPIO` are kept; anything
/// else is trimmed and upper-cased.
pub fn normalize_pin(raw: &str) -> String {
    let s = raw.trim().to_ascii_uppercase();
    if s.starts_with("GPIO") {
        return s;
    }
    if let Some(digits) = s.strip_prefix('D') {
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return format!("GPIO{digits}");
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalize_pin_maps_board_names() {
        assert_eq!(normalize_pin("D4"), "GPIO4");
        assert_eq!(normalize_pin(" d17 "), "GPIO17");
        assert_eq!(normalize_pin("gpio22"), "GPIO22");
        assert_eq!(normalize_pin("Dx"), "DX");
        assert_eq!(normalize_pin("D"), "D");
        assert_eq!(normalize_pin(""), "");
    }

    #[test]
    fn failed_measurement_has_no_values() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap();
        let r = Reading::captured_at(
            "edge-1",
            "DHT22",
            "GPIO4",
            Measurement::Failed {
                error: "checksum".to_owned(),
            },
            TimestampMode::Utc,
            at,
        );
        assert!(!r.ok);
        assert_eq!(r.value_a, None);
        assert_eq!(r.value_b, None);
        assert_eq!(r.error_text.as_deref(), Some("checksum"));
        assert_eq!(r.captured_at_epoch, at.timestamp());
        assert_eq!(r.captured_at_text, "2026-03-01 12:30:05");
    }

    #[test]
    fn each_reading_gets_a_distinct_id() {
        let m = Measurement::Ok {
            value_a: 21.5,
            value_b: 40.0,
        };
        let a = Reading::new("edge-1", "DHT11", "GPIO4", m.clone(), TimestampMode::Utc);
        let b = Reading::new("edge-1", "DHT11", "GPIO4", m, TimestampMode::Utc);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn delivery_state_codes_round_trip_and_reject_unknown() {
        for s in [
            DeliveryState::Pending,
            DeliveryState::Synced,
            DeliveryState::Dead,
        ] {
            assert_eq!(DeliveryState::from_i64(s.as_i64()), Some(s));
        }
        assert_eq!(DeliveryState::from_i64(7), None);
        assert!(!DeliveryState::Pending.is_terminal());
        assert!(DeliveryState::Dead.is_terminal());
    }

    #[test]
    fn timestamp_mode_parses_case_insensitively() {
        assert_eq!("UTC".parse::<TimestampMode>(), Ok(TimestampMode::Utc));
        assert_eq!(" local ".parse::<TimestampMode>(), Ok(TimestampMode::Local));
        assert!("gmt".parse::<TimestampMode>().is_err());
    }
}
