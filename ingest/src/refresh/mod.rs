//! Coalescing scheduler for materialized view refreshes.
//!
//! Ingestion tasks and direct batch writes do not refresh views themselves, they hand a
//! request to the scheduler and move on. The scheduler folds bursts of requests into
//! single refreshes and spaces refreshes of the same view apart by a configurable
//! cooldown, so a stream of small loads cannot saturate the warehouse with refresh
//! work.

pub mod scheduler;

pub use scheduler::*;
