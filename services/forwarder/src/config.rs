//! Forwarder configuration loading.
//!
//! Sources, lowest to highest priority: built-in defaults, an optional TOML
//! file, then `RELAY_*` environment variables. The result is one immutable
//! `RelayConfig` built at startup and handed to each component by reference.
//! Default config path: `/etc/telemetry-relay/relay.toml` (may be absent).
//!
//! # Password file format
//! Raw password on a single line; trimmed on read.

use crate::remote::postgres::MAX_READINGS_PER_STATEMENT;
use relay_queue::TimestampMode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/telemetry-relay/relay.toml";
pub const ENV_PREFIX: &str = "RELAY_";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub log_level: String,
    pub device: DeviceConfig,
    pub queue: QueueConfig,
    pub forwarder: ForwarderConfig,
    pub retention: RetentionConfig,
    pub remote: RemoteConfig,
    pub status_http: StatusHttpConfig,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub key: String,
    pub location: Option<String>,
    /// Explicit override; None means detect the outbound interface address.
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub sqlite_path: String,
    pub timestamp_mode: TimestampMode,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub interval: Duration,
    pub idle_poll: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: u32,
    pub backoff_ceiling: Duration,
    pub backoff_exponent_cap: u32,
    pub local_backoff_ceiling: Duration,
    pub local_exponent_cap: u32,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub days: u32,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub ssl_mode: String,
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct StatusHttpConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            log_level: "info".to_owned(),
            device: DeviceConfig {
                key: "edge-unknown".to_owned(),
                location: None,
                ip: None,
            },
            queue: QueueConfig {
                sqlite_path: "/var/lib/telemetry-relay/queue.sqlite3".to_owned(),
                timestamp_mode: TimestampMode::Utc,
                busy_timeout: Duration::from_secs(30),
            },
            forwarder: ForwarderConfig {
                interval: Duration::from_secs(5),
                idle_poll: Duration::from_secs(1),
                batch_size: 200,
                max_attempts: 50,
                backoff_base: 2,
                backoff_ceiling: Duration::from_secs(300),
                backoff_exponent_cap: 8,
                local_backoff_ceiling: Duration::from_secs(30),
                local_exponent_cap: 5,
            },
            retention: RetentionConfig {
                enabled: true,
                days: 90,
            },
            remote: RemoteConfig {
                enabled: true,
                host: String::new(),
                port: 5432,
                database: "telemetry".to_owned(),
                user: String::new(),
                password: String::new(),
                connect_timeout: Duration::from_secs(5),
                ssl_mode: "disable".to_owned(),
                run_migrations: false,
            },
            status_http: StatusHttpConfig {
                enabled: false,
                bind: "127.0.0.1:8080".to_owned(),
            },
        }
    }
}

impl RemoteConfig {
    /// Names of required connection fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("remote.host");
        }
        if self.user.trim().is_empty() {
            missing.push("remote.user");
        }
        if self.password.is_empty() {
            missing.push("remote.password");
        }
        if self.database.trim().is_empty() {
            missing.push("remote.database");
        }
        missing
    }

    /// True when delivery can be attempted at all.
    pub fn is_ready(&self) -> bool {
        self.enabled && self.missing_fields().is_empty()
    }

    /// One-line summary for logs. Never includes the password itself.
    pub fn readiness_report(&self) -> String {
        let or_empty = |s: &str| {
            if s.is_empty() {
                "<empty>".to_owned()
            } else {
                s.to_owned()
            }
        };
        let missing = self.missing_fields();
        format!(
            "enabled={} host={} port={} database={} user={} password={} missing={}",
            self.enabled,
            or_empty(&self.host),
            self.port,
            or_empty(&self.database),
            or_empty(&self.user),
            if self.password.is_empty() { "<empty>" } else { "<set>" },
            if missing.is_empty() {
                "-".to_owned()
            } else {
                missing.join(",")
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    log_level: Option<String>,
    device: Option<RawDeviceConfig>,
    queue: Option<RawQueueConfig>,
    forwarder: Option<RawForwarderConfig>,
    retention: Option<RawRetentionConfig>,
    remote: Option<RawRemoteConfig>,
    status_http: Option<RawStatusHttpConfig>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    key: Option<String>,
    location: Option<String>,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQueueConfig {
    sqlite_path: Option<String>,
    timestamp_mode: Option<String>,
    lock_retry_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawForwarderConfig {
    interval_secs: Option<f64>,
    idle_poll_secs: Option<f64>,
    batch_size: Option<usize>,
    max_attempts: Option<u32>,
    backoff_base: Option<u32>,
    backoff_ceiling_secs: Option<u64>,
    backoff_exponent_cap: Option<u32>,
    local_backoff_ceiling_secs: Option<u64>,
    local_exponent_cap: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawRetentionConfig {
    enabled: Option<bool>,
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawRemoteConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    password_file: Option<String>,
    connect_timeout_secs: Option<u64>,
    ssl_mode: Option<String>,
    run_migrations: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttpConfig {
    enabled: Option<bool>,
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment source
// ---------------------------------------------------------------------------

/// Abstraction over environment lookups so tests can inject overrides.
pub trait EnvSource {
    /// Look up `RELAY_<key>`.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
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

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from an explicit path, or from the default path when it exists,
/// or from defaults alone; then apply process environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    match path {
        Some(p) => load_config_from_path(p, &ProcessEnv),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_config_from_path(default_path, &ProcessEnv)
            } else {
                load_config_from_str("", &ProcessEnv)
            }
        }
    }
}

pub fn load_config_from_path<E: EnvSource>(
    path: &Path,
    env: &E,
) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str, env)
}

/// Load config from a TOML string (may be empty) plus environment overrides.
pub fn load_config_from_str<E: EnvSource>(
    toml_str: &str,
    env: &E,
) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut cfg = RelayConfig::default();
    apply_raw(&mut cfg, raw)?;
    apply_env_overrides(&mut cfg, env)?;
    validate(&cfg)?;
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Layering
// ---------------------------------------------------------------------------

fn apply_raw(cfg: &mut RelayConfig, raw: RawConfig) -> Result<(), ConfigError> {
    if let Some(level) = raw.log_level {
        cfg.log_level = level;
    }

    if let Some(d) = raw.device {
        if let Some(key) = d.key {
            cfg.device.key = key;
        }
        cfg.device.location = non_empty(d.location).or(cfg.device.location.take());
        cfg.device.ip = non_empty(d.ip).or(cfg.device.ip.take());
    }

    if let Some(q) = raw.queue {
        if let Some(path) = q.sqlite_path {
            cfg.queue.sqlite_path = path;
        }
        if let Some(mode) = q.timestamp_mode {
            cfg.queue.timestamp_mode = mode.parse().map_err(ConfigError::InvalidValue)?;
        }
        if let Some(secs) = q.lock_retry_secs {
            cfg.queue.busy_timeout = secs_f64("queue.lock_retry_secs", secs)?;
        }
    }

    if let Some(f) = raw.forwarder {
        if let Some(secs) = f.interval_secs {
            cfg.forwarder.interval = secs_f64("forwarder.interval_secs", secs)?;
        }
        if let Some(secs) = f.idle_poll_secs {
            cfg.forwarder.idle_poll = secs_f64("forwarder.idle_poll_secs", secs)?;
        }
        if let Some(v) = f.batch_size {
            cfg.forwarder.batch_size = v;
        }
        if let Some(v) = f.max_attempts {
            cfg.forwarder.max_attempts = v;
        }
        if let Some(v) = f.backoff_base {
            cfg.forwarder.backoff_base = v;
        }
        if let Some(v) = f.backoff_ceiling_secs {
            cfg.forwarder.backoff_ceiling = Duration::from_secs(v);
        }
        if let Some(v) = f.backoff_exponent_cap {
            cfg.forwarder.backoff_exponent_cap = v;
        }
        if let Some(v) = f.local_backoff_ceiling_secs {
            cfg.forwarder.local_backoff_ceiling = Duration::from_secs(v);
        }
        if let Some(v) = f.local_exponent_cap {
            cfg.forwarder.local_exponent_cap = v;
        }
    }

    if let Some(r) = raw.retention {
        if let Some(v) = r.enabled {
            cfg.retention.enabled = v;
        }
        if let Some(v) = r.days {
            cfg.retention.days = v;
        }
    }

    if let Some(r) = raw.remote {
        if let Some(v) = r.enabled {
            cfg.remote.enabled = v;
        }
        if let Some(v) = r.host {
            cfg.remote.host = v;
        }
        if let Some(v) = r.port {
            cfg.remote.port = v;
        }
        if let Some(v) = r.database {
            cfg.remote.database = v;
        }
        if let Some(v) = r.user {
            cfg.remote.user = v;
        }
        if let Some(v) = r.password {
            cfg.remote.password = v;
        }
        if let Some(path) = r.password_file {
            cfg.remote.password = read_password_file(&path)?;
        }
        if let Some(v) = r.connect_timeout_secs {
            cfg.remote.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = r.ssl_mode {
            cfg.remote.ssl_mode = v;
        }
        if let Some(v) = r.run_migrations {
            cfg.remote.run_migrations = v;
        }
    }

    if let Some(s) = raw.status_http {
        if let Some(v) = s.enabled {
            cfg.status_http.enabled = v;
        }
        if let Some(v) = s.bind {
            cfg.status_http.bind = v;
        }
    }

    Ok(())
}

/// Apply `RELAY_*` overrides (highest priority). Empty values count as unset.
pub fn apply_env_overrides<E: EnvSource>(
    cfg: &mut RelayConfig,
    env: &E,
) -> Result<(), ConfigError> {
    if let Some(v) = env_string(env, "LOG_LEVEL") {
        cfg.log_level = v;
    }

    if let Some(v) = env_string(env, "DEVICE_KEY") {
        cfg.device.key = v;
    }
    if let Some(v) = env_string(env, "DEVICE_LOCATION") {
        cfg.device.location = Some(v);
    }
    if let Some(v) = env_string(env, "DEVICE_IP") {
        cfg.device.ip = Some(v);
    }

    if let Some(v) = env_string(env, "SQLITE_PATH") {
        cfg.queue.sqlite_path = v;
    }
    if let Some(v) = env_string(env, "TIMESTAMP_MODE") {
        cfg.queue.timestamp_mode = v.parse().map_err(ConfigError::InvalidValue)?;
    }

    if let Some(v) = env_parse::<f64, _>(env, "SYNC_INTERVAL_SECS")? {
        cfg.forwarder.interval = secs_f64("RELAY_SYNC_INTERVAL_SECS", v)?;
    }
    if let Some(v) = env_parse(env, "BATCH_SIZE")? {
        cfg.forwarder.batch_size = v;
    }
    if let Some(v) = env_parse(env, "MAX_ATTEMPTS")? {
        cfg.forwarder.max_attempts = v;
    }
    if let Some(v) = env_parse(env, "BACKOFF_CEILING_SECS")? {
        cfg.forwarder.backoff_ceiling = Duration::from_secs(v);
    }

    if let Some(v) = env_bool(env, "RETENTION_ENABLED")? {
        cfg.retention.enabled = v;
    }
    if let Some(v) = env_parse(env, "RETENTION_DAYS")? {
        cfg.retention.days = v;
    }

    if let Some(v) = env_bool(env, "REMOTE_ENABLED")? {
        cfg.remote.enabled = v;
    }
    if let Some(v) = env_string(env, "REMOTE_HOST") {
        cfg.remote.host = v;
    }
    if let Some(v) = env_parse(env, "REMOTE_PORT")? {
        cfg.remote.port = v;
    }
    if let Some(v) = env_string(env, "REMOTE_DATABASE") {
        cfg.remote.database = v;
    }
    if let Some(v) = env_string(env, "REMOTE_USER") {
        cfg.remote.user = v;
    }
    if let Some(v) = env_string(env, "REMOTE_PASSWORD") {
        cfg.remote.password = v;
    }
    if let Some(v) = env_parse(env, "REMOTE_CONNECT_TIMEOUT_SECS")? {
        cfg.remote.connect_timeout = Duration::from_secs(v);
    }
    if let Some(v) = env_string(env, "REMOTE_SSL_MODE") {
        cfg.remote.ssl_mode = v;
    }

    if let Some(v) = env_bool(env, "STATUS_HTTP_ENABLED")? {
        cfg.status_http.enabled = v;
    }
    if let Some(v) = env_string(env, "STATUS_HTTP_BIND") {
        cfg.status_http.bind = v;
    }

    Ok(())
}

fn validate(cfg: &RelayConfig) -> Result<(), ConfigError> {
    if cfg.device.key.trim().is_empty() {
        return Err(ConfigError::InvalidValue("device.key must not be empty".to_owned()));
    }
    if cfg.queue.sqlite_path.trim().is_empty() {
        return Err(ConfigError::InvalidValue(
            "queue.sqlite_path must not be empty".to_owned(),
        ));
    }
    if cfg.forwarder.interval.is_zero() {
        return Err(ConfigError::InvalidValue(
            "forwarder.interval_secs must be > 0".to_owned(),
        ));
    }
    if cfg.forwarder.batch_size == 0 {
        return Err(ConfigError::InvalidValue(
            "forwarder.batch_size must be >= 1".to_owned(),
        ));
    }
    if cfg.forwarder.batch_size > MAX_READINGS_PER_STATEMENT {
        return Err(ConfigError::InvalidValue(format!(
            "forwarder.batch_size must be <= {MAX_READINGS_PER_STATEMENT}, got {}",
            cfg.forwarder.batch_size
        )));
    }
    if cfg.forwarder.idle_poll.is_zero() {
        return Err(ConfigError::InvalidValue(
            "forwarder.idle_poll_secs must be > 0".to_owned(),
        ));
    }
    if cfg.forwarder.backoff_ceiling.is_zero() {
        return Err(ConfigError::InvalidValue(
            "forwarder.backoff_ceiling_secs must be >= 1".to_owned(),
        ));
    }
    if cfg.forwarder.local_backoff_ceiling.is_zero() {
        return Err(ConfigError::InvalidValue(
            "forwarder.local_backoff_ceiling_secs must be >= 1".to_owned(),
        ));
    }
    if cfg.forwarder.max_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "forwarder.max_attempts must be >= 1".to_owned(),
        ));
    }
    if cfg.forwarder.backoff_base < 2 {
        return Err(ConfigError::InvalidValue(format!(
            "forwarder.backoff_base must be >= 2, got {}",
            cfg.forwarder.backoff_base
        )));
    }
    if cfg.retention.days == 0 {
        return Err(ConfigError::InvalidValue(
            "retention.days must be >= 1".to_owned(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

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

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_password_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading password file '{}': {}", path, e)))?;
    let password = content.trim().to_owned();
    if password.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "remote.password_file '{path}' is empty"
        )));
    }
    Ok(password)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

fn secs_f64(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::InvalidValue(format!("{field} must be a non-negative number")))
}

fn env_string<E: EnvSource>(env: &E, key: &str) -> Option<String> {
    non_empty(env.get(key)).map(|s| s.trim().to_owned())
}

fn env_parse<T, E>(env: &E, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    E: EnvSource,
{
    match env_string(env, key) {
        Some(v) => v.parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidValue(format!("{ENV_PREFIX}{key}: cannot parse '{v}'"))
        }),
        None => Ok(None),
    }
}

fn env_bool<E: EnvSource>(env: &E, key: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(env, key) {
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue(format!(
                "{ENV_PREFIX}{key}: expected a boolean, got '{v}'"
            ))),
        },
        None => Ok(None),
    }
}
