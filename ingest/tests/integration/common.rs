use std::time::Duration;

use ingest::service::IngestService;
use ingest::state::task::{TaskPhaseType, TaskStatus};
use ingest::store::WarehouseStore;
use ingest::types::TaskId;
use ingest_config::shared::ServiceConfig;
use tokio::time::Instant;

/// Service configuration tuned for fast tests.
///
/// Retries back off in milliseconds instead of minutes, and refreshes carry no
/// cooldown so reports catch up as soon as the scheduler runs.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.ingest.retry_base_delay_ms = 5;
    config.refresh.cooldown_ms = 0;

    config
}

pub async fn started_service<S>(store: S) -> IngestService<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    started_service_with(test_config(), store).await
}

pub async fn started_service_with<S>(config: ServiceConfig, store: S) -> IngestService<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    let mut service = IngestService::new(config, store);
    service.start().await.unwrap();

    service
}

/// Polls a task until it reaches a terminal phase.
pub async fn wait_for_terminal<S>(service: &IngestService<S>, task_id: TaskId) -> TaskStatus
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        let status = service.get_task_status(task_id).await.unwrap();
        if status.phase.is_terminal() {
            return status;
        }

        assert!(
            Instant::now() < deadline,
            "task {task_id} did not reach a terminal phase in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls a task until the given phase type is observed.
///
/// Fails fast if the task ends in a terminal phase other than the expected one.
pub async fn wait_for_phase<S>(service: &IngestService<S>, task_id: TaskId, phase: TaskPhaseType)
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        let status = service.get_task_status(task_id).await.unwrap();
        if status.phase == phase {
            return;
        }

        assert!(
            !status.phase.is_terminal(),
            "task {task_id} ended in {:?} while waiting for {phase:?}",
            status.phase
        );
        assert!(
            Instant::now() < deadline,
            "task {task_id} did not reach {phase:?} in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
