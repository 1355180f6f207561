//! Workers that drive ingestion tasks from submission to a terminal phase.
//!
//! An [`ingest::IngestWorker`] owns a single task: it decodes and validates the CSV
//! stream, chunks rows, and loads chunks with bounded fan-out and transient-error
//! retries. The [`pool::IngestWorkerPool`] schedules workers so that each target table
//! runs at most one task at a time, in submission order, while different tables
//! progress in parallel.

pub mod ingest;
pub mod pool;
pub mod retry;
