// forwarder: Library entry point.
// Exposes modules for the binary and integration tests.

pub mod backoff;
pub mod config;
pub mod cycle;
pub mod gateway;
pub mod identity;
pub mod isolator;
pub mod remote;
pub mod selector;
pub mod status_http;
pub mod sweeper;
