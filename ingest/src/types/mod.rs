//! Common types used throughout the ingestion service.
//!
//! Re-exports the target table enumeration, typed entity rows, rejection records, and
//! task identity shared across the pipeline.

mod rejection;
mod row;
mod sized;
mod table;
mod task;

pub use rejection::*;
pub use row::*;
pub use sized::*;
pub use table::*;
pub use task::*;
