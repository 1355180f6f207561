//! Storage backends for the warehouse tables and their materialized aggregates.
//!
//! The [`WarehouseStore`] trait is the seam between the pipeline and storage.
//! Two backends ship with the crate: [`memory::MemoryStore`] keeps everything
//! in process for tests and development, [`postgres::PostgresStore`] runs
//! against a Postgres warehouse.

mod base;

pub mod memory;
pub mod postgres;

pub use base::*;
