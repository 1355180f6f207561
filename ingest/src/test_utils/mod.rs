//! Testing utilities for exercising the ingestion service.
//!
//! These helpers back the integration tests under `tests/` and are available to
//! downstream crates through the `test-utils` feature. They cover the three things
//! ingestion tests keep needing:
//!
//! - [`notify`] - waiting for asynchronous state changes with a hard timeout, so a
//!   wedged pipeline fails the test instead of hanging it.
//! - [`stores`] - [`crate::store::WarehouseStore`] wrappers that inject scripted
//!   failures, hold loads open, and signal method calls.
//! - [`csv`] - byte-stream builders that deliver fixture CSV in arbitrary pieces, for
//!   exercising record reassembly across network-sized reads.

pub mod csv;
pub mod notify;
pub mod stores;
