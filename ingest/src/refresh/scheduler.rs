use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::store::{ViewKind, WarehouseStore};

/// Floor on the delay before a failed refresh is retried, applied when the configured
/// cooldown is shorter. Keeps a persistently failing store from being hammered in a
/// tight loop.
const MIN_FAILURE_BACKOFF: Duration = Duration::from_millis(250);

/// Bookkeeping for one materialized view.
///
/// `pending` and `in_flight` together enforce the coalescing rule: at most one queued
/// request and at most one running refresh per view, everything else folds into the
/// queued request.
#[derive(Debug, Default)]
struct ViewState {
    pending: bool,
    in_flight: bool,
    /// Earliest instant the next refresh may start, set when a refresh finishes.
    next_allowed: Option<Instant>,
}

#[derive(Debug)]
struct SchedulerShared {
    views: Mutex<HashMap<ViewKind, ViewState>>,
    /// Woken whenever a request changes the pending set.
    wakeup: Notify,
}

/// Cheaply cloneable handle for submitting refresh requests to the scheduler.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    shared: Arc<SchedulerShared>,
}

impl RefreshHandle {
    /// Records that `view` must be refreshed and wakes the scheduler.
    ///
    /// Returns once the request is queued, which is all a caller may rely on. The
    /// refresh itself runs later: requests arriving while one is already queued or
    /// running collapse into a single follow-up refresh, and requests landing inside
    /// the cooldown window are deferred to the next allowed instant.
    pub async fn request_refresh(&self, view: ViewKind) {
        let mut views = self.shared.views.lock().await;
        let state = views.entry(view).or_default();

        if !state.pending {
            state.pending = true;

            debug!(view = %view, "refresh requested");
        }

        drop(views);

        // notify_one stores a permit, so a request landing between two scheduler
        // passes is picked up by the next pass instead of being lost.
        self.shared.wakeup.notify_one();
    }
}

/// Handle for monitoring and joining the refresh scheduler task.
#[derive(Debug)]
pub struct RefreshWorkerHandle {
    handle: Option<JoinHandle<IngestResult<()>>>,
}

impl RefreshWorkerHandle {
    /// Waits for the scheduler task to complete after shutdown was signaled.
    ///
    /// Properly surfaces panics that might occur within the scheduler task.
    pub async fn wait(mut self) -> IngestResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            if err.is_cancelled() {
                ingest_error!(
                    ErrorKind::TaskCancelled,
                    "Refresh scheduler was cancelled",
                    err
                )
            } else {
                ingest_error!(
                    ErrorKind::RefreshWorkerPanic,
                    "Refresh scheduler panicked",
                    err
                )
            }
        })??;

        Ok(())
    }
}

/// Scheduler that serializes and coalesces materialized view refreshes.
///
/// [`RefreshScheduler`] owns the post-load half of the pipeline. Loaders request
/// refreshes through a [`RefreshHandle`] and never touch the views directly, which
/// keeps view maintenance off the ingestion hot path and guarantees that concurrent
/// tasks cannot trigger overlapping refreshes of the same view.
#[derive(Debug)]
pub struct RefreshScheduler<S> {
    store: S,
    cooldown: Duration,
    shared: Arc<SchedulerShared>,
    shutdown_rx: ShutdownRx,
}

impl<S> RefreshScheduler<S> {
    /// Creates a new scheduler refreshing views through `store`.
    ///
    /// A zero `cooldown` disables inter-refresh spacing.
    pub fn new(store: S, cooldown: Duration, shutdown_rx: ShutdownRx) -> Self {
        let views = ViewKind::ALL
            .into_iter()
            .map(|view| (view, ViewState::default()))
            .collect();

        Self {
            store,
            cooldown,
            shared: Arc::new(SchedulerShared {
                views: Mutex::new(views),
                wakeup: Notify::new(),
            }),
            shutdown_rx,
        }
    }

    /// Returns a handle for submitting refresh requests.
    pub fn handle(&self) -> RefreshHandle {
        RefreshHandle {
            shared: self.shared.clone(),
        }
    }
}

impl<S> RefreshScheduler<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    /// Spawns the scheduler and returns a handle for joining it.
    ///
    /// The scheduler runs until the shutdown signal fires. A refresh that is already
    /// running when shutdown arrives is allowed to finish, queued requests are
    /// discarded.
    pub fn spawn(self) -> RefreshWorkerHandle {
        info!("starting refresh scheduler");

        let span = tracing::info_span!("refresh_scheduler");
        let handle = tokio::spawn(self.run().instrument(span.or_current()));

        RefreshWorkerHandle {
            handle: Some(handle),
        }
    }

    async fn run(mut self) -> IngestResult<()> {
        loop {
            let (due_now, earliest_deferred) = self.next_due().await;

            if let Some(view) = due_now {
                self.refresh(view).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    info!("refresh scheduler stopped by shutdown signal");

                    return Ok(());
                }

                _ = self.shared.wakeup.notified() => {}

                _ = wait_until(earliest_deferred) => {}
            }
        }
    }

    /// Scans the views for work.
    ///
    /// Returns a view whose refresh may start right now, if any, together with the
    /// earliest deadline among views that are pending but still cooling down.
    async fn next_due(&self) -> (Option<ViewKind>, Option<Instant>) {
        let views = self.shared.views.lock().await;
        let now = Instant::now();

        let mut earliest_deferred: Option<Instant> = None;

        // Iterate in declaration order so scans are deterministic.
        for view in ViewKind::ALL {
            let Some(state) = views.get(&view) else {
                continue;
            };

            if !state.pending || state.in_flight {
                continue;
            }

            match state.next_allowed {
                Some(allowed_at) if allowed_at > now => {
                    earliest_deferred = Some(match earliest_deferred {
                        Some(current) => current.min(allowed_at),
                        None => allowed_at,
                    });
                }
                _ => return (Some(view), None),
            }
        }

        (None, earliest_deferred)
    }

    async fn refresh(&self, view: ViewKind) {
        {
            let mut views = self.shared.views.lock().await;
            let state = views.entry(view).or_default();
            state.pending = false;
            state.in_flight = true;
        }

        debug!(view = %view, "refreshing materialized view");

        let started_at = Instant::now();
        let result = self.store.refresh_view(view).await;

        let mut views = self.shared.views.lock().await;
        let state = views.entry(view).or_default();
        state.in_flight = false;

        if !self.cooldown.is_zero() {
            state.next_allowed = Some(Instant::now() + self.cooldown);
        }

        match result {
            Ok(()) => {
                debug!(
                    view = %view,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "materialized view refreshed",
                );
            }
            Err(err) => {
                // Keep the request alive so the refresh is retried. The data is
                // already committed, only its aggregate visibility lags behind.
                state.pending = true;
                state.next_allowed =
                    Some(Instant::now() + self.cooldown.max(MIN_FAILURE_BACKOFF));

                warn!(
                    view = %view,
                    error = %err,
                    "materialized view refresh failed, retry scheduled",
                );
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
