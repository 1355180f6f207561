//! Tracing initialization for the ingestion service.

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Default filter directive applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVE: &str = "info";

// Tests from multiple modules race to install the subscriber, and installing
// twice panics, so the test initializer has to be guarded.
static TEST_INIT: Once = Once::new();

/// Initializes the global tracing subscriber for binaries and examples.
///
/// The filter is taken from `RUST_LOG` and falls back to `info`.
pub fn init_tracing() -> Result<(), TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .finish()
        .try_init()
}

/// Initializes tracing for tests, once per process.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_test_tracing() {
    TEST_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_test_writer()
            .init();
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}
