//! Collector configuration loading.
//!
//! Reads the same TOML file as the forwarder; only `log_level`, `[device]`,
//! `[queue]` and `[collector]` matter here. Unknown sections are ignored.
//! `RELAY_*` environment variables override file values.

use relay_queue::{TimestampMode, normalize_pin};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/telemetry-relay/relay.toml";
pub const ENV_PREFIX: &str = "RELAY_";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub log_level: String,
    pub device_key: String,
    pub sqlite_path: String,
    pub timestamp_mode: TimestampMode,
    /// SQLite busy timeout, and the wait before retrying a failed append.
    pub lock_retry: Duration,
    pub sensor_type: String,
    pub pin: String,
    pub read_interval: Duration,
    pub retry_interval: Duration,
    /// Failed samples in a row before the sensor is reset.
    pub max_consecutive_errors: u32,
    /// Share of simulated samples that fail, 0.0..=1.0.
    pub failure_ratio: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            log_level: "info".to_owned(),
            device_key: "edge-unknown".to_owned(),
            sqlite_path: "/var/lib/telemetry-relay/queue.sqlite3".to_owned(),
            timestamp_mode: TimestampMode::Utc,
            lock_retry: Duration::from_secs(30),
            sensor_type: "DHT11".to_owned(),
            pin: "GPIO4".to_owned(),
            read_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            max_consecutive_errors: 10,
            failure_ratio: 0.0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    log_level: Option<String>,
    device: Option<RawDevice>,
    queue: Option<RawQueue>,
    collector: Option<RawCollector>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    sqlite_path: Option<String>,
    timestamp_mode: Option<String>,
    lock_retry_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCollector {
    sensor_type: Option<String>,
    pin: Option<String>,
    read_interval_secs: Option<f64>,
    retry_interval_secs: Option<f64>,
    max_consecutive_errors: Option<u32>,
    failure_ratio: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Environment lookups, injectable for tests.
pub trait EnvSource {
    /// Look up `RELAY_<key>`.
    fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{key}")).ok()
    }
}

impl EnvSource for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::HashMap::get(self, &format!("{ENV_PREFIX}{key}")).cloned()
    }
}

pub fn load_config(path: Option<&Path>) -> Result<CollectorConfig, ConfigError> {
    let path = match path {
        Some(p) => Some(p),
        None => Some(Path::new(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
    };
    let toml_str = match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", p.display(), e)))?,
        None => String::new(),
    };
    load_config_from_str(&toml_str, &ProcessEnv)
}

pub fn load_config_from_str<E: EnvSource>(
    toml_str: &str,
    env: &E,
) -> Result<CollectorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut cfg = CollectorConfig::default();

    if let Some(level) = raw.log_level {
        cfg.log_level = level;
    }
    if let Some(key) = raw.device.and_then(|d| d.key) {
        cfg.device_key = key;
    }
    if let Some(q) = raw.queue {
        if let Some(p) = q.sqlite_path {
            cfg.sqlite_path = p;
        }
        if let Some(m) = q.timestamp_mode {
            cfg.timestamp_mode = m.parse().map_err(ConfigError::InvalidValue)?;
        }
        if let Some(secs) = q.lock_retry_secs {
            cfg.lock_retry = secs_f64("queue.lock_retry_secs", secs)?;
        }
    }
    if let Some(c) = raw.collector {
        if let Some(v) = c.sensor_type {
            cfg.sensor_type = v;
        }
        if let Some(v) = c.pin {
            cfg.pin = v;
        }
        if let Some(secs) = c.read_interval_secs {
            cfg.read_interval = secs_f64("collector.read_interval_secs", secs)?;
        }
        if let Some(secs) = c.retry_interval_secs {
            cfg.retry_interval = secs_f64("collector.retry_interval_secs", secs)?;
        }
        if let Some(v) = c.max_consecutive_errors {
            cfg.max_consecutive_errors = v;
        }
        if let Some(v) = c.failure_ratio {
            cfg.failure_ratio = v;
        }
    }

    apply_env_overrides(&mut cfg, env)?;
    cfg.pin = normalize_pin(&cfg.pin);
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_env_overrides<E: EnvSource>(cfg: &mut CollectorConfig, env: &E) -> Result<(), ConfigError> {
    if let Some(v) = env_string(env, "LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Some(v) = env_string(env, "DEVICE_KEY") {
        cfg.device_key = v;
    }
    if let Some(v) = env_string(env, "SQLITE_PATH") {
        cfg.sqlite_path = v;
    }
    if let Some(v) = env_string(env, "TIMESTAMP_MODE") {
        cfg.timestamp_mode = v.parse().map_err(ConfigError::InvalidValue)?;
    }
    if let Some(v) = env_string(env, "SENSOR_TYPE") {
        cfg.sensor_type = v;
    }
    if let Some(v) = env_string(env, "SENSOR_PIN") {
        cfg.pin = v;
    }
    if let Some(v) = env_string(env, "READ_INTERVAL_SECS") {
        let secs: f64 = v.parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{ENV_PREFIX}READ_INTERVAL_SECS: cannot parse '{v}'"))
        })?;
        cfg.read_interval = secs_f64("RELAY_READ_INTERVAL_SECS", secs)?;
    }
    Ok(())
}

fn validate(cfg: &CollectorConfig) -> Result<(), ConfigError> {
    if cfg.device_key.trim().is_empty() {
        return Err(ConfigError::MissingField("device.key".to_owned()));
    }
    if cfg.sensor_type.trim().is_empty() {
        return Err(ConfigError::MissingField("collector.sensor_type".to_owned()));
    }
    if cfg.read_interval.is_zero() {
        return Err(ConfigError::InvalidValue(
            "collector.read_interval_secs must be > 0".to_owned(),
        ));
    }
    if cfg.max_consecutive_errors == 0 {
        return Err(ConfigError::InvalidValue(
            "collector.max_consecutive_errors must be >= 1".to_owned(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.failure_ratio) {
        return Err(ConfigError::InvalidValue(format!(
            "collector.failure_ratio must be within 0..=1, got {}",
            cfg.failure_ratio
        )));
    }
    Ok(())
}

fn secs_f64(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::InvalidValue(format!("{field} must be a non-negative number")))
}

fn env_string<E: EnvSource>(env: &E, key: &str) -> Option<String> {
    env.get(key)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_follow_the_edge_device() {
        let cfg = load_config_from_str("", &HashMap::new()).unwrap();
        assert_eq!(cfg.sensor_type, "DHT11");
        assert_eq!(cfg.pin, "GPIO4");
        assert_eq!(cfg.read_interval, Duration::from_secs(10));
        assert_eq!(cfg.retry_interval, Duration::from_secs(2));
    }

    #[test]
    fn shared_file_sections_are_read_and_others_ignored() {
        let toml = r#"
[device]
key = "edge-9"

[forwarder]
batch_size = 10

[collector]
sensor_type = "DHT22"
pin = "d17"
read_interval_secs = 0.5
"#;
        let cfg = load_config_from_str(toml, &HashMap::new()).unwrap();
        assert_eq!(cfg.device_key, "edge-9");
        assert_eq!(cfg.sensor_type, "DHT22");
        assert_eq!(cfg.pin, "GPIO17");
        assert_eq!(cfg.read_interval, Duration::from_millis(500));
    }

    #[test]
    fn env_wins_over_file() {
        let env: HashMap<String, String> = [("RELAY_SENSOR_PIN".to_owned(), "D22".to_owned())]
            .into_iter()
            .collect();
        let cfg = load_config_from_str("[collector]\npin = \"GPIO4\"\n", &env).unwrap();
        assert_eq!(cfg.pin, "GPIO22");
    }

    #[test]
    fn zero_error_threshold_is_rejected() {
        let err = load_config_from_str("[collector]\nmax_consecutive_errors = 0\n", &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("max_consecutive_errors"));
    }

    #[test]
    fn failure_ratio_out_of_range_is_rejected() {
        assert!(load_config_from_str("[collector]\nfailure_ratio = 1.5\n", &HashMap::new()).is_err());
    }
}
