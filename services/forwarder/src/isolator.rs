//! Poison-pill isolation by bisection.
//!
//! A rejected bulk write is split in half and each half retried on its own,
//! recursively, until every healthy reading is stored and each offending
//! reading is left alone in a rejected batch of one. Halves keep the original
//! order, left before right, so delivery stays oldest-first.
//!
//! Only `RemoteError::Rejected` triggers a split. Any other error aborts the
//! whole delivery.

use crate::remote::{RemoteError, RemoteReading, RemoteStore};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedReading {
    pub id: Uuid,
    pub reason: String,
}

/// What one isolated delivery did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IsolationReport {
    /// Stored readings, in original order.
    pub delivered: Vec<Uuid>,
    /// Readings rejected on their own.
    pub rejected: Vec<RejectedReading>,
    /// Every `upsert_readings` call made.
    pub write_calls: usize,
    /// Calls that came back rejected.
    pub rejected_calls: usize,
}

impl IsolationReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Deliver `rows`, isolating rejected readings.
///
/// `Err` means a non-rejection failure interrupted delivery; readings written
/// before it are already stored remotely and will be re-sent idempotently.
pub async fn deliver<R: RemoteStore>(
    remote: &R,
    rows: &[RemoteReading],
) -> Result<IsolationReport, RemoteError> {
    let mut report = IsolationReport::default();
    deliver_split(remote, rows, &mut report).await?;
    Ok(report)
}

fn deliver_split<'a, R: RemoteStore>(
    remote: &'a R,
    rows: &'a [RemoteReading],
    report: &'a mut IsolationReport,
) -> BoxFuture<'a, Result<(), RemoteError>> {
    async move {
        if rows.is_empty() {
            return Ok(());
        }
        report.write_calls += 1;
        match remote.upsert_readings(rows).await {
            Ok(()) => {
                report.delivered.extend(rows.iter().map(|r| r.id));
                Ok(())
            }
            Err(RemoteError::Rejected(reason)) => {
                report.rejected_calls += 1;
                if let [single] = rows {
                    tracing::warn!(reading_id = %single.id, reason = %reason, "isolated rejected reading");
                    report.rejected.push(RejectedReading {
                        id: single.id,
                        reason,
                    });
                    return Ok(());
                }
                let (left, right) = rows.split_at(rows.len() / 2);
                deliver_split(remote, left, &mut *report).await?;
                deliver_split(remote, right, &mut *report).await
            }
            Err(e) => Err(e),
        }
    }
    .boxed()
}
