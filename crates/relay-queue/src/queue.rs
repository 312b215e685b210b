//! Durable SQLite queue of sensor readings.
//!
//! # Schema
//! - `queue_readings`: one row per reading, unique on `id`, carrying the
//!   delivery bookkeeping (`delivery_state`, `attempts`, `last_attempt_at`).
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, busy_timeout, temp_store=MEMORY,
//! foreign_keys=ON. PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! Every public operation is its own short transaction. WAL lets the collector
//! append while the forwarder reads and updates through a second connection.

use crate::reading::{CAPTURED_AT_FORMAT, DeliveryState, Reading};
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, params};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Lock wait applied to every connection unless overridden.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// True when the failure is lock contention that clears on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A reading together with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedReading {
    pub reading: Reading,
    pub delivery_state: DeliveryState,
    pub attempts: u32,
    pub last_attempt_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub synced: u64,
    pub dead: u64,
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

pub struct QueueStore {
    conn: Connection,
}

impl QueueStore {
    /// Open (or create) the queue at `path` with the default lock wait.
    pub fn open(path: &Path) -> QueueResult<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open (or create) the queue, waiting at most `busy_timeout` on a locked
    /// database before an operation fails with a transient error.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> QueueResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, busy_timeout)
    }

    pub fn open_in_memory() -> QueueResult<Self> {
        Self::init(Connection::open_in_memory()?, DEFAULT_BUSY_TIMEOUT)
    }

    fn init(conn: Connection, busy_timeout: Duration) -> QueueResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(QueueStore { conn })
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Persist a new reading as `pending` with zero attempts.
    ///
    /// Returns once the row is committed (synchronous=FULL).
    pub fn append(&mut self, reading: &Reading) -> QueueResult<()> {
        for (field, value) in [
            ("device_key", &reading.device_key),
            ("sensor_type", &reading.sensor_type),
            ("pin", &reading.pin),
        ] {
            if value.trim().is_empty() {
                return Err(QueueError::InvalidData(format!("{field} must not be empty")));
            }
        }

        self.conn.execute(
            "INSERT INTO queue_readings
                 (id, device_key, sensor_type, pin, captured_at_epoch, captured_at_text,
                  value_a, value_b, ok, error_text, delivery_state, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0)",
            params![
                reading.id.to_string(),
                reading.device_key,
                reading.sensor_type,
                reading.pin,
                reading.captured_at_epoch,
                reading.captured_at_text,
                reading.value_a,
                reading.value_b,
                reading.ok,
                reading.error_text,
            ],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Forwarder side
    // -----------------------------------------------------------------------

    /// Up to `limit` pending readings, oldest `captured_at_epoch` first.
    pub fn select_pending(&self, limit: usize) -> QueueResult<Vec<QueuedReading>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, device_key, sensor_type, pin, captured_at_epoch, captured_at_text,
                    value_a, value_b, ok, error_text, delivery_state, attempts, last_attempt_at
             FROM queue_readings
             WHERE delivery_state = 0
             ORDER BY captured_at_epoch ASC, seq ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Mark pending readings delivered. Increments `attempts` on each.
    ///
    /// Returns the number of rows changed; ids that are unknown or already
    /// terminal are skipped.
    pub fn mark_synced(&mut self, ids: &[Uuid]) -> QueueResult<usize> {
        self.record_attempt(ids, Some(DeliveryState::Synced))
    }

    /// Record a failed delivery attempt for pending readings. The readings stay
    /// pending; `attempts` is incremented.
    pub fn mark_failed_attempt(&mut self, ids: &[Uuid]) -> QueueResult<usize> {
        self.record_attempt(ids, None)
    }

    fn record_attempt(
        &mut self,
        ids: &[Uuid],
        new_state: Option<DeliveryState>,
    ) -> QueueResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().format(CAPTURED_AT_FORMAT).to_string();
        let state = new_state.unwrap_or(DeliveryState::Pending).as_i64();

        let tx = self.conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE queue_readings
                 SET delivery_state = ?1, attempts = attempts + 1, last_attempt_at = ?2
                 WHERE id = ?3 AND delivery_state = 0",
            )?;
            for id in ids {
                changed += stmt.execute(params![state, now, id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Promote pending readings with `attempts >= max_attempts` to dead.
    pub fn sweep_dead(&mut self, max_attempts: u32) -> QueueResult<usize> {
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "UPDATE queue_readings
             SET delivery_state = 2
             WHERE delivery_state = 0 AND attempts >= ?1",
            params![i64::from(max_attempts)],
        )?;
        tx.commit()?;
        Ok(n)
    }

    /// Delete synced or dead readings captured before `cutoff_epoch`.
    /// Pending readings are never deleted.
    pub fn prune_retained(&mut self, cutoff_epoch: i64) -> QueueResult<usize> {
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "DELETE FROM queue_readings
             WHERE captured_at_epoch < ?1 AND delivery_state IN (1, 2)",
            params![cutoff_epoch],
        )?;
        tx.commit()?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Query helpers
    // -----------------------------------------------------------------------

    pub fn get(&self, id: Uuid) -> QueueResult<Option<QueuedReading>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_key, sensor_type, pin, captured_at_epoch, captured_at_text,
                    value_a, value_b, ok, error_text, delivery_state, attempts, last_attempt_at
             FROM queue_readings
             WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id.to_string()], map_row)?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    pub fn counts(&self) -> QueueResult<QueueCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT delivery_state, COUNT(*) FROM queue_readings GROUP BY delivery_state",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = QueueCounts::default();
        for r in rows {
            let (state, n) = r?;
            let n = u64::try_from(n).unwrap_or(0);
            match DeliveryState::from_i64(state) {
                Some(DeliveryState::Pending) => counts.pending = n,
                Some(DeliveryState::Synced) => counts.synced = n,
                Some(DeliveryState::Dead) => counts.dead = n,
                None => {
                    return Err(QueueError::InvalidData(format!(
                        "unknown delivery_state {state}"
                    )));
                }
            }
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> QueueResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA temp_store=MEMORY;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> QueueResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(QueueError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn map_row(row: &rusqlite::Row<'_>) -> Result<QueuedReading, rusqlite::Error> {
    let id_text: String = row.get(0)?;
    let id = Uuid::parse_str(&id_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let state_code: i64 = row.get(10)?;
    let delivery_state = DeliveryState::from_i64(state_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            Type::Integer,
            format!("unknown delivery_state {state_code}").into(),
        )
    })?;
    let attempts: i64 = row.get(11)?;

    Ok(QueuedReading {
        reading: Reading {
            id,
            device_key: row.get(1)?,
            sensor_type: row.get(2)?,
            pin: row.get(3)?,
            captured_at_epoch: row.get(4)?,
            captured_at_text: row.get(5)?,
            value_a: row.get(6)?,
            value_b: row.get(7)?,
            ok: row.get(8)?,
            error_text: row.get(9)?,
        },
        delivery_state,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_attempt_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Measurement;

    fn reading_at(epoch: i64) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            device_key: "edge-1".to_owned(),
            sensor_type: "DHT22".to_owned(),
            pin: "GPIO4".to_owned(),
            captured_at_epoch: epoch,
            captured_at_text: format!("epoch-{epoch}"),
            value_a: Some(20.0),
            value_b: Some(50.0),
            ok: true,
            error_text: None,
        }
    }

    #[test]
    fn append_starts_pending_with_zero_attempts() {
        let mut q = QueueStore::open_in_memory().unwrap();
        let r = reading_at(100);
        q.append(&r).unwrap();

        let stored = q.get(r.id).unwrap().expect("row exists");
        assert_eq!(stored.reading, r);
        assert_eq!(stored.delivery_state, DeliveryState::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.last_attempt_at, None);
    }

    #[test]
    fn append_rejects_empty_identity_fields() {
        let mut q = QueueStore::open_in_memory().unwrap();
        let mut r = reading_at(1);
        r.pin = "  ".to_owned();
        let err = q.append(&r).unwrap_err();
        assert!(matches!(err, QueueError::InvalidData(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn append_rejects_duplicate_id() {
        let mut q = QueueStore::open_in_memory().unwrap();
        let r = reading_at(1);
        q.append(&r).unwrap();
        assert!(q.append(&r).is_err(), "duplicate id must not be accepted");
        assert_eq!(q.counts().unwrap().pending, 1);
    }

    #[test]
    fn failed_measurement_round_trips_with_null_values() {
        let mut q = QueueStore::open_in_memory().unwrap();
        let r = Reading::new(
            "edge-1",
            "DHT11",
            "GPIO4",
            Measurement::Failed {
                error: "null reading".to_owned(),
            },
            crate::TimestampMode::Utc,
        );
        q.append(&r).unwrap();
        let stored = q.get(r.id).unwrap().unwrap();
        assert!(!stored.reading.ok);
        assert_eq!(stored.reading.value_a, None);
        assert_eq!(stored.reading.error_text.as_deref(), Some("null reading"));
    }

    #[test]
    fn readings_in_the_same_second_keep_append_order() {
        let mut q = QueueStore::open_in_memory().unwrap();
        let first = reading_at(500);
        let second = reading_at(500);
        q.append(&first).unwrap();
        q.append(&second).unwrap();
        let ids: Vec<Uuid> = q
            .select_pending(10)
            .unwrap()
            .into_iter()
            .map(|r| r.reading.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn empty_id_list_is_a_no_op() {
        let mut q = QueueStore::open_in_memory().unwrap();
        assert_eq!(q.mark_synced(&[]).unwrap(), 0);
        assert_eq!(q.mark_failed_attempt(&[]).unwrap(), 0);
    }

    #[test]
    fn counts_group_by_state() {
        let mut q = QueueStore::open_in_memory().unwrap();
        let a = reading_at(1);
        let b = reading_at(2);
        let c = reading_at(3);
        for r in [&a, &b, &c] {
            q.append(r).unwrap();
        }
        q.mark_synced(&[a.id]).unwrap();
        q.mark_failed_attempt(&[b.id]).unwrap();
        q.sweep_dead(1).unwrap();

        assert_eq!(
            q.counts().unwrap(),
            QueueCounts {
                pending: 1,
                synced: 1,
                dead: 1
            }
        );
    }
}
