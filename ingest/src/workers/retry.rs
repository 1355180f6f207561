use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, IngestError};

/// Cap on the backoff exponent so the delay stops doubling at some point.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Returns `true` if `error` is a transient infrastructure failure worth retrying.
///
/// Dropped connections, serialization conflicts between concurrent batches, and chunk
/// loads that ran into their deadline can all succeed on a later attempt. Data errors
/// never can, the same rows would fail the same way again.
pub fn is_transient(error: &IngestError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::StorageConnectionFailed
            | ErrorKind::SerializationConflict
            | ErrorKind::StorageTimeout
    )
}

/// Calculates the delay before the next attempt after `failed_attempts` failures.
///
/// Uses exponential backoff: delay = base_delay * 2^(failed_attempts - 1).
/// Adds random jitter of up to 30% to prevent thundering herd.
pub fn backoff_delay(base_delay: Duration, failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let exponential_ms = base_delay.as_millis() as f64 * 2f64.powi(exponent as i32);

    // Jitter: random factor between 0 and 0.3
    let jitter_factor = rand::rng().random::<f64>() * 0.3;
    let jittered_ms = exponential_ms * (1.0 + jitter_factor);

    Duration::from_millis(jittered_ms as u64)
}
