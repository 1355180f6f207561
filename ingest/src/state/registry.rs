use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::state::task::{TaskState, TaskStatus};
use crate::types::TaskId;

/// Shared registry of every task accepted by the service.
///
/// Tasks are retained after completion so status stays queryable. Eviction after a
/// retention window is an external concern.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<TaskId, TaskState>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task state under its own id.
    pub async fn register(&self, state: TaskState) {
        let task_id = state.lock().await.task_id();

        self.inner.lock().await.insert(task_id, state);
    }

    /// Returns the state handle of a task, if it is known.
    pub async fn get(&self, task_id: TaskId) -> Option<TaskState> {
        self.inner.lock().await.get(&task_id).cloned()
    }

    /// Returns a serializable snapshot of a task.
    pub async fn task_status(&self, task_id: TaskId) -> IngestResult<TaskStatus> {
        let state = self.require(task_id).await?;
        let status = state.lock().await.snapshot();

        Ok(status)
    }

    /// Requests cooperative cancellation of a task.
    ///
    /// Cancelling a task that already reached a terminal phase is a no-op. The signal
    /// only asks the worker to stop at the next chunk boundary, in-flight chunk loads
    /// still run to completion.
    pub async fn cancel(&self, task_id: TaskId) -> IngestResult<()> {
        let state = self.require(task_id).await?;

        let inner = state.lock().await;
        if !inner.phase().as_type().is_terminal() {
            inner.request_cancel();
        }

        Ok(())
    }

    async fn require(&self, task_id: TaskId) -> IngestResult<TaskState> {
        self.get(task_id).await.ok_or_else(|| {
            ingest_error!(
                ErrorKind::MissingTask,
                "Task not found",
                format!("no ingestion task with id {task_id} is known to this service")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::task::{TaskPhase, TaskPhaseType};
    use crate::types::TableKind;

    #[tokio::test]
    async fn test_unknown_task_is_reported_as_missing() {
        let registry = TaskRegistry::new();

        let err = registry.task_status(TaskId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingTask);

        let err = registry.cancel(TaskId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingTask);
    }

    #[tokio::test]
    async fn test_cancel_signals_only_non_terminal_tasks() {
        let registry = TaskRegistry::new();

        let (state, mut cancel_rx) = TaskState::new(TaskId::new(), TableKind::Departments);
        registry.register(state.clone()).await;

        let task_id = state.lock().await.task_id();
        registry.cancel(task_id).await.unwrap();
        assert!(cancel_rx.has_changed().unwrap());

        cancel_rx.mark_unchanged();
        state.lock().await.set(TaskPhase::Completed);

        registry.cancel(task_id).await.unwrap();
        assert!(!cancel_rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_status_reflects_registered_state() {
        let registry = TaskRegistry::new();

        let (state, _cancel_rx) = TaskState::new(TaskId::new(), TableKind::Jobs);
        registry.register(state.clone()).await;

        let task_id = state.lock().await.task_id();
        let status = registry.task_status(task_id).await.unwrap();

        assert_eq!(status.task_id, task_id);
        assert_eq!(status.table, TableKind::Jobs);
        assert_eq!(status.phase, TaskPhaseType::Pending);
    }
}
