//! Concurrency utilities for coordinating ingestion pipeline operations.
//!
//! This module provides the concurrency primitives used throughout the ingestion system
//! to coordinate workers, handle graceful shutdown, and manage streaming data flows.
//!
//! The ingestion system uses a multi-worker architecture where different pieces
//! coordinate through well-defined patterns:
//!
//! - **Ingest workers** drive a single file submission from validation to load
//! - **Worker pools** schedule ingest workers and serialize access per target table
//! - **The refresh scheduler** coalesces materialized view refresh requests
//!
//! The [`shutdown`] module implements a broadcast-based shutdown pattern where a single
//! signal terminates multiple workers, workers flush their current chunk boundary before
//! stopping, and cleanup happens in an order that cannot deadlock. The [`stream`] module
//! groups validated rows into bounded chunks while integrating shutdown signals into the
//! polling loop.

pub mod shutdown;
pub mod stream;
