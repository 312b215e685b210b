// collector: Library entry point.
// Exposes modules for the binary and integration tests.

pub mod config;
pub mod producer;
pub mod sensor;
