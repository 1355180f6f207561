use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::info;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::types::{RejectedRow, TableKind, TaskId};

/// Reason string recorded when a task is stopped by an explicit cancellation request.
pub const CANCELLED_REASON: &str = "cancelled";

/// Reason string recorded when a task is stopped by service shutdown.
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Lifecycle phase of an ingestion task.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TaskPhase {
    /// Set when the submission is accepted, before a worker picks the task up.
    Pending,
    /// Set by the ingest worker when it starts consuming the stream. Validation and
    /// loading overlap, so this phase only covers the stretch before the first chunk is
    /// dispatched.
    Validating,
    /// Set when the first chunk is handed to the bulk loader.
    Loading,
    /// Set once every chunk reached a terminal outcome, while the refresh handoff to the
    /// aggregate scheduler is in progress.
    Refreshing,
    /// Terminal. Every row was either loaded or rejected and a refresh was enqueued.
    Completed,
    /// Terminal. The task was aborted, with the reason recorded.
    Failed {
        /// Human-readable description of what stopped the task.
        reason: String,
    },
}

impl TaskPhase {
    pub fn as_type(&self) -> TaskPhaseType {
        self.into()
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed({reason})"),
            other => write!(f, "{}", other.as_type()),
        }
    }
}

/// A variant of [`TaskPhase`] that can be used to determine the current phase of a task
/// without having to pattern match on the data fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhaseType {
    Pending,
    Validating,
    Loading,
    Refreshing,
    Completed,
    Failed,
}

impl TaskPhaseType {
    /// Returns `true` if a task in this phase is done processing, `false` otherwise.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` if a task in this phase occupies its table lane, `false`
    /// otherwise.
    ///
    /// At most one task per target table may be in an active phase at a time. Queued
    /// tasks stay [`TaskPhaseType::Pending`] until the lane frees up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Validating | Self::Loading | Self::Refreshing)
    }

    pub fn as_static_str(&self) -> &'static str {
        match self {
            TaskPhaseType::Pending => "pending",
            TaskPhaseType::Validating => "validating",
            TaskPhaseType::Loading => "loading",
            TaskPhaseType::Refreshing => "refreshing",
            TaskPhaseType::Completed => "completed",
            TaskPhaseType::Failed => "failed",
        }
    }
}

impl<'a> From<&'a TaskPhase> for TaskPhaseType {
    fn from(phase: &'a TaskPhase) -> Self {
        match phase {
            TaskPhase::Pending => Self::Pending,
            TaskPhase::Validating => Self::Validating,
            TaskPhase::Loading => Self::Loading,
            TaskPhase::Refreshing => Self::Refreshing,
            TaskPhase::Completed => Self::Completed,
            TaskPhase::Failed { .. } => Self::Failed,
        }
    }
}

impl fmt::Display for TaskPhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_static_str())
    }
}

/// Point-in-time snapshot of a task, safe to serialize into status responses.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub table: TableKind,
    pub phase: TaskPhaseType,
    /// Failure reason for tasks that ended in [`TaskPhaseType::Failed`].
    pub last_error: Option<String>,
    /// Number of records consumed from the stream so far, malformed ones included.
    pub total_rows_seen: u64,
    pub rows_loaded: u64,
    pub rows_rejected: u64,
    /// Capped sample of rejected rows. [`TaskStatus::rows_rejected`] stays exact even
    /// when the sample is truncated.
    pub rejected_samples: Vec<RejectedRow>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Internal state of [`TaskState`].
#[derive(Debug)]
pub struct TaskStateInner {
    /// Unique identifier of the task this structure tracks.
    task_id: TaskId,
    /// Table the task loads into.
    table: TableKind,
    /// Current lifecycle phase, this is the authoritative in-memory state.
    phase: TaskPhase,
    /// Notification mechanism for broadcasting phase changes to waiting callers.
    phase_change: Arc<Notify>,
    /// Transmitter of the cooperative cancellation signal for this task.
    cancel_tx: ShutdownTx,
    total_rows_seen: u64,
    rows_loaded: u64,
    rows_rejected: u64,
    rejected_samples: Vec<RejectedRow>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskStateInner {
    /// Updates the task's phase and notifies all waiting callers.
    ///
    /// Terminal phases also stamp the completion timestamp.
    pub fn set(&mut self, phase: TaskPhase) {
        info!(
            task_id = %self.task_id,
            table = %self.table,
            from_phase = %self.phase,
            to_phase = %phase,
            "task phase changing",
        );

        if phase.as_type().is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }

        self.phase = phase;

        // Broadcast notification to all active waiters.
        //
        // Note that this notify will not wake up waiters that will be coming in the
        // future since no permit is stored, only active listeners will be notified.
        self.phase_change.notify_waiters();
    }

    /// Returns the current lifecycle phase of this task.
    pub fn phase(&self) -> TaskPhase {
        self.phase.clone()
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn table(&self) -> TableKind {
        self.table
    }

    /// Adds records consumed from the stream to the progress counter.
    pub fn record_seen(&mut self, records: u64) {
        self.total_rows_seen += records;
    }

    /// Adds successfully applied rows to the progress counter.
    ///
    /// Rows ignored by idempotent conflict handling count as loaded, a retried chunk
    /// must not shrink the total.
    pub fn record_loaded(&mut self, rows: u64) {
        self.rows_loaded += rows;
    }

    /// Records rejected rows, keeping at most `sample_limit` of them as samples.
    ///
    /// The rejection counter is always exact, only the retained sample is capped.
    pub fn record_rejected<I>(&mut self, rows: I, sample_limit: usize)
    where
        I: IntoIterator<Item = RejectedRow>,
    {
        for row in rows {
            self.rows_rejected += 1;

            if self.rejected_samples.len() < sample_limit {
                self.rejected_samples.push(row);
            }
        }
    }

    /// Sends the cooperative cancellation signal for this task.
    ///
    /// Send failures are ignored, they only mean the worker already finished and
    /// dropped its receiver.
    pub fn request_cancel(&self) {
        let _ = self.cancel_tx.shutdown();
    }

    /// Returns a serializable snapshot of the current state.
    pub fn snapshot(&self) -> TaskStatus {
        let last_error = match &self.phase {
            TaskPhase::Failed { reason } => Some(reason.clone()),
            _ => None,
        };

        TaskStatus {
            task_id: self.task_id,
            table: self.table,
            phase: self.phase.as_type(),
            last_error,
            total_rows_seen: self.total_rows_seen,
            rows_loaded: self.rows_loaded,
            rows_rejected: self.rows_rejected,
            rejected_samples: self.rejected_samples.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Thread-safe handle for ingestion task state management.
///
/// [`TaskState`] wraps the task lifecycle state so the worker driving the task, the
/// registry serving status queries, and tests can all observe and react to phase
/// changes. It supports atomic updates, notifications, and blocking waits for specific
/// phase transitions.
#[derive(Debug, Clone)]
pub struct TaskState {
    inner: Arc<Mutex<TaskStateInner>>,
}

impl TaskState {
    /// Creates a new task state in [`TaskPhase::Pending`].
    ///
    /// Returns the state handle together with the cancellation receiver for the worker
    /// that will drive this task. The receiver is created eagerly so a cancellation
    /// issued before the worker starts is still observed.
    pub fn new(task_id: TaskId, table: TableKind) -> (Self, ShutdownRx) {
        let (cancel_tx, cancel_rx) = create_shutdown_channel();

        let inner = TaskStateInner {
            task_id,
            table,
            phase: TaskPhase::Pending,
            phase_change: Arc::new(Notify::new()),
            cancel_tx,
            total_rows_seen: 0,
            rows_loaded: 0,
            rows_rejected: 0,
            rejected_samples: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        };

        let state = Self {
            inner: Arc::new(Mutex::new(inner)),
        };

        (state, cancel_rx)
    }

    /// Waits for the task to reach a specific phase type.
    ///
    /// This method blocks until either the task reaches one of the desired phases or a
    /// shutdown signal is received. It uses the phase change notification to avoid
    /// polling.
    pub async fn wait_for_phase_type(
        &self,
        phase_types: &[TaskPhaseType],
        mut shutdown_rx: ShutdownRx,
    ) -> ShutdownResult<MutexGuard<'_, TaskStateInner>, ()> {
        loop {
            let inner = self.inner.lock().await;

            let current_phase = inner.phase.as_type();
            if phase_types.contains(&current_phase) {
                return ShutdownResult::Ok(inner);
            }

            // We listen for the phase change while holding the lock to avoid the race
            // condition which occurs when we release the lock, the value changes, and
            // then we wait for a value change, in that case, we will miss the
            // notification and the system will stall.
            let phase_change = inner.phase_change.clone();
            let phase_change_notified = phase_change.notified();

            // We must drop the lock here so that state changes can actually happen.
            drop(inner);

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!(phase_types = ?phase_types, "shutdown signal received, cancelling wait for phase");

                    return ShutdownResult::Shutdown(());
                }

                _ = phase_change_notified => {
                    // Phase changed, loop to check if it's the desired phase.
                }
            }
        }
    }
}

impl Deref for TaskState {
    type Target = Mutex<TaskStateInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
