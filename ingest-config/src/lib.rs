//! Configuration types and hierarchical loading for the ingestion service.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{LoadConfigError, load_config, load_config_from_dir};
