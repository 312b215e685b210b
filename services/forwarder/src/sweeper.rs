//! Daily maintenance: retention pruning, then dead-letter promotion.
//!
//! The last-run date lives in memory only. A restart may repeat the sweep on
//! the same day, which is harmless: both operations are idempotent bulk
//! statements, each in its own transaction.

use chrono::{DateTime, NaiveDate, Utc};
use relay_queue::{QueueError, QueueStore};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pruned: usize,
    pub dead_lettered: usize,
}

#[derive(Debug)]
pub struct MaintenanceSweeper {
    max_attempts: u32,
    /// None disables retention pruning.
    retention_days: Option<u32>,
    last_run: Option<NaiveDate>,
}

impl MaintenanceSweeper {
    pub fn new(max_attempts: u32, retention_days: Option<u32>) -> Self {
        MaintenanceSweeper {
            max_attempts,
            retention_days,
            last_run: None,
        }
    }

    pub fn last_run(&self) -> Option<NaiveDate> {
        self.last_run
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_run != Some(now.date_naive())
    }

    /// Run the sweep if today's has not completed yet.
    ///
    /// The date is recorded only after both steps succeed, so a failed sweep is
    /// retried on the next cycle.
    pub fn run_if_due(
        &mut self,
        queue: &mut QueueStore,
        now: DateTime<Utc>,
    ) -> Result<Option<SweepReport>, QueueError> {
        if !self.is_due(now) {
            return Ok(None);
        }
        let report = self.run(queue, now)?;
        self.last_run = Some(now.date_naive());
        Ok(Some(report))
    }

    fn run(&self, queue: &mut QueueStore, now: DateTime<Utc>) -> Result<SweepReport, QueueError> {
        let pruned = match self.retention_days {
            Some(days) => {
                let cutoff = now.timestamp() - i64::from(days) * SECS_PER_DAY;
                let n = queue.prune_retained(cutoff)?;
                tracing::info!(pruned = n, cutoff_epoch = cutoff, "retention pruning done");
                n
            }
            None => 0,
        };

        let dead_lettered = queue.sweep_dead(self.max_attempts)?;
        if dead_lettered > 0 {
            tracing::warn!(
                dead_lettered,
                max_attempts = self.max_attempts,
                "readings moved to dead-letter"
            );
        }

        Ok(SweepReport {
            pruned,
            dead_lettered,
        })
    }
}
