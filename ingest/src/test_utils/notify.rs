use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

/// How long a test waits on a notification before giving up.
///
/// Generous compared to how long any pipeline step should take, so a trip means
/// the awaited state is unreachable rather than slow.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Test-side wrapper around [`Notify`] that panics instead of hanging.
///
/// Waiting on a state change that never happens would otherwise stall the whole
/// test run until the harness kills it, losing the failure location. The
/// built-in deadline turns that into an immediate panic at the await point.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
}

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }

    /// Waits for a notification, panicking after [`NOTIFY_TIMEOUT`].
    pub async fn notified(&self) {
        let waited = timeout(NOTIFY_TIMEOUT, self.notify.notified()).await;

        assert!(
            waited.is_ok(),
            "no notification within {NOTIFY_TIMEOUT:?}, the awaited state was never reached",
        );
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify").finish()
    }
}
