//! Task lifecycle state tracking for the ingestion service.
//!
//! Every accepted submission gets a [`task::TaskState`] handle that carries the
//! authoritative in-memory phase, progress counters, and a capped sample of rejected
//! rows. Handles are shared between the worker driving the task and the
//! [`registry::TaskRegistry`] serving status queries and cancellation requests.

pub mod registry;
pub mod task;
