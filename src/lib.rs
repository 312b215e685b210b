//! Edge-to-cloud telemetry relay.
//!
//! The workspace is split by process:
//! - [`queue`]: the durable SQLite reading queue shared by both processes
//! - [`collector`]: the producer, sampling a sensor into the queue
//! - [`forwarder`]: drains the queue into the central store
//!
//! This crate only re-exports them, so end-to-end tests can drive a whole
//! edge device from one place.

pub use collector;
pub use forwarder;
pub use relay_queue as queue;
