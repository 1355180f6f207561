pub mod concurrency;
pub mod error;
pub mod load;
mod macros;
pub mod records;
pub mod refresh;
pub mod reports;
pub mod service;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
