use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Chunk sizing configuration for bulk ingestion.
///
/// A chunk closes as soon as either cap is reached, whichever comes first.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of rows in one chunk.
    #[serde(default = "default_batch_max_rows")]
    pub max_rows: usize,
    /// Maximum raw input size, in bytes, of one chunk.
    #[serde(default = "default_batch_max_bytes")]
    pub max_bytes: usize,
}

impl BatchConfig {
    /// Default maximum number of rows per chunk.
    pub const DEFAULT_MAX_ROWS: usize = 50_000;

    /// Default maximum raw size per chunk (8 MiB).
    pub const DEFAULT_MAX_BYTES: usize = 8 * 1024 * 1024;

    /// Validates chunk sizing settings.
    ///
    /// Ensures both caps are non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_rows == 0 {
            return Err(ValidationError::non_zero("batch.max_rows"));
        }

        if self.max_bytes == 0 {
            return Err(ValidationError::non_zero("batch.max_bytes"));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: default_batch_max_rows(),
            max_bytes: default_batch_max_bytes(),
        }
    }
}

fn default_batch_max_rows() -> usize {
    BatchConfig::DEFAULT_MAX_ROWS
}

fn default_batch_max_bytes() -> usize {
    BatchConfig::DEFAULT_MAX_BYTES
}
