//! Batch selection: one page of pending readings per forwarder cycle.

use relay_queue::{QueueError, QueueStore, QueuedReading};

/// Pulls the oldest pending readings, at most `batch_size` per call.
///
/// Pure read; a selected reading stays pending until the forwarder records
/// the delivery outcome.
#[derive(Debug, Clone, Copy)]
pub struct BatchSelector {
    batch_size: usize,
}

impl BatchSelector {
    pub fn new(batch_size: usize) -> Self {
        BatchSelector {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn next_batch(&self, queue: &QueueStore) -> Result<Vec<QueuedReading>, QueueError> {
        queue.select_pending(self.batch_size)
    }

    /// True when `batch` filled the page, i.e. more backlog is likely waiting.
    pub fn is_full(&self, batch_len: usize) -> bool {
        batch_len >= self.batch_size
    }
}
