use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Pipeline behavior configuration for asynchronous ingestion tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IngestConfig {
    /// Depth of the bounded queue between chunk production and chunk loading.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Maximum number of chunks of one task loaded in parallel.
    #[serde(default = "default_load_fanout")]
    pub load_fanout: usize,
    /// Maximum number of load attempts for a chunk that fails transiently.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Base delay, in milliseconds, between retries of a failed chunk load.
    ///
    /// The delay doubles per attempt and carries jitter.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound, in milliseconds, on the execution time of one chunk load.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Maximum number of rejected rows retained per task for status queries.
    ///
    /// Rejection counts remain exact beyond this cap; only the samples are bounded.
    #[serde(default = "default_rejected_sample_limit")]
    pub rejected_sample_limit: usize,
    /// Whether uploaded CSV files carry a header line with column names.
    #[serde(default = "default_csv_has_header")]
    pub csv_has_header: bool,
}

impl IngestConfig {
    /// Default depth of the chunk queue between producer and loader.
    pub const DEFAULT_QUEUE_DEPTH: usize = 4;

    /// Default parallel load fan-out within one task.
    pub const DEFAULT_LOAD_FANOUT: usize = 4;

    /// Default maximum number of attempts per chunk.
    pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

    /// Default base retry delay (one minute).
    pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 60_000;

    /// Default per-chunk execution timeout (five minutes).
    pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 300_000;

    /// Default cap on retained rejected-row samples per task.
    pub const DEFAULT_REJECTED_SAMPLE_LIMIT: usize = 100;

    /// Validates ingestion settings.
    ///
    /// Ensures queue depth, fan-out, attempt count, and timeout are non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue_depth == 0 {
            return Err(ValidationError::non_zero("ingest.queue_depth"));
        }

        if self.load_fanout == 0 {
            return Err(ValidationError::non_zero("ingest.load_fanout"));
        }

        if self.retry_max_attempts == 0 {
            return Err(ValidationError::non_zero("ingest.retry_max_attempts"));
        }

        if self.chunk_timeout_ms == 0 {
            return Err(ValidationError::non_zero("ingest.chunk_timeout_ms"));
        }

        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            load_fanout: default_load_fanout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            rejected_sample_limit: default_rejected_sample_limit(),
            csv_has_header: default_csv_has_header(),
        }
    }
}

fn default_queue_depth() -> usize {
    IngestConfig::DEFAULT_QUEUE_DEPTH
}

fn default_load_fanout() -> usize {
    IngestConfig::DEFAULT_LOAD_FANOUT
}

fn default_retry_max_attempts() -> u32 {
    IngestConfig::DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_retry_base_delay_ms() -> u64 {
    IngestConfig::DEFAULT_RETRY_BASE_DELAY_MS
}

fn default_chunk_timeout_ms() -> u64 {
    IngestConfig::DEFAULT_CHUNK_TIMEOUT_MS
}

fn default_rejected_sample_limit() -> usize {
    IngestConfig::DEFAULT_REJECTED_SAMPLE_LIMIT
}

fn default_csv_has_header() -> bool {
    true
}
