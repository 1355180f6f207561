use std::time::Duration;

use ingest::error::ErrorKind;
use ingest::state::task::{SHUTDOWN_REASON, TaskPhaseType};
use ingest::store::memory::MemoryStore;
use ingest::test_utils::csv::{stalled_source, whole_source};
use ingest::test_utils::stores::{ScriptedStore, StoreMethod};
use ingest::types::TableKind;
use ingest_telemetry::init_test_tracing;
use tokio::time::Instant;

use crate::common::{started_service, wait_for_phase, wait_for_terminal};

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_drains_queued_tasks() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    let stalled = service
        .submit_ingestion(TableKind::Departments, stalled_source())
        .await
        .unwrap();
    wait_for_phase(&service, stalled, TaskPhaseType::Validating).await;

    let queued = service
        .submit_ingestion(
            TableKind::Departments,
            whole_source("id,department\n1,Engineering\n"),
        )
        .await
        .unwrap();

    service.shutdown();

    let status = wait_for_terminal(&service, stalled).await;
    assert_eq!(status.phase, TaskPhaseType::Failed);
    assert_eq!(status.last_error.as_deref(), Some(SHUTDOWN_REASON));

    let status = wait_for_terminal(&service, queued).await;
    assert_eq!(status.phase, TaskPhaseType::Failed);
    assert_eq!(status.last_error.as_deref(), Some(SHUTDOWN_REASON));

    service.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_retries_fail_the_task() {
    init_test_tracing();

    let store = ScriptedStore::new(MemoryStore::new());
    let service = started_service(store.clone()).await;

    store.fail_next_loads(ErrorKind::StorageConnectionFailed, 3);

    let task_id = service
        .submit_ingestion(
            TableKind::Departments,
            whole_source("id,department\n1,Engineering\n"),
        )
        .await
        .unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Failed);
    assert_eq!(status.last_error.as_deref(), Some("Injected load failure"));
    assert_eq!(status.rows_loaded, 0);

    assert_eq!(store.calls(StoreMethod::LoadRows), 3);

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_refresh_is_retried_until_reports_catch_up() {
    init_test_tracing();

    let store = ScriptedStore::new(MemoryStore::new());
    let service = started_service(store.clone()).await;

    store.fail_next_refreshes(ErrorKind::StorageQueryFailed, 1);

    service
        .batch_write(
            TableKind::Departments,
            vec![vec!["1".into(), "Engineering".into()]],
        )
        .await
        .unwrap();
    service
        .batch_write(TableKind::Jobs, vec![vec!["1".into(), "Engineer".into()]])
        .await
        .unwrap();
    service
        .batch_write(
            TableKind::HiredEmployees,
            vec![vec![
                "1".into(),
                "Avery".into(),
                "2021-05-10T08:00:00Z".into(),
                "1".into(),
                "1".into(),
            ]],
        )
        .await
        .unwrap();

    // The injected failure delays one view, the scheduler retries it until the
    // report reflects the hire.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let report = service.get_quarterly_hires(2021).await.unwrap();
        if report.total_rows == 1 {
            break;
        }

        assert!(
            Instant::now() < deadline,
            "aggregates were not refreshed in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(store.calls(StoreMethod::RefreshView) >= 2);

    service.shutdown_and_wait().await.unwrap();
}
