//! Testing utilities and mock implementations
//!
//! Mocks for providers, health checks, process samplers and notification
//! sinks, used by the crate's own tests and available to downstream tests.

pub mod mocks;

pub use mocks::*;
