//! CSV record decoding and row validation.
//!
//! The [`stream`] module turns an arbitrary byte stream into a sequence of CSV records
//! without ever buffering the input in full, keeping quoted fields with embedded
//! newlines intact. The [`validate`] module type-checks one record at a time against
//! the target table layout, and [`rows`] composes the two into the row stream the
//! ingest worker chunks and loads.

pub mod rows;
pub mod stream;
pub mod validate;
