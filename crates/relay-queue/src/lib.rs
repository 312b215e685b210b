//! relay-queue: the durable local reading queue shared by the collector
//! (append-only producer) and the forwarder (delivery state owner).

pub mod queue;
pub mod reading;

pub use queue::{QueueCounts, QueueError, QueueStore, QueuedReading};
pub use reading::{DeliveryState, Measurement, Reading, TimestampMode, normalize_pin};
