use std::time::Duration;

use ingest::error::ErrorKind;
use ingest::state::task::TaskPhaseType;
use ingest::store::memory::MemoryStore;
use ingest::test_utils::csv::{rechunked_source, split_source, stalled_source, whole_source};
use ingest::test_utils::stores::{GatedStore, ScriptedStore, StoreMethod};
use ingest::types::{RejectReason, TableKind};
use ingest_telemetry::init_test_tracing;

use crate::common::{
    started_service, started_service_with, test_config, wait_for_phase, wait_for_terminal,
};

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_failure_is_retried_without_duplicates() {
    init_test_tracing();

    let store = ScriptedStore::new(MemoryStore::new());
    let mut config = test_config();
    config.batch.max_rows = 2;

    let service = started_service_with(config, store.clone()).await;

    store.fail_next_loads(ErrorKind::StorageConnectionFailed, 1);

    let csv = "id,department\n1,Engineering\n2,Product\n3,Support\n4,Finance\n5,Legal\n";
    let task_id = service
        .submit_ingestion(TableKind::Departments, whole_source(csv))
        .await
        .unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Completed);
    assert_eq!(status.total_rows_seen, 5);
    assert_eq!(status.rows_loaded, 5);
    assert_eq!(status.rows_rejected, 0);

    // Three chunks of at most two rows, plus the one retried attempt.
    assert_eq!(store.calls(StoreMethod::LoadRows), 4);

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_row_is_rejected_alone() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    let csv = "id,department\n1,Engineering\nnot-a-number,Product\n3,Support\n4,Finance\n";
    let task_id = service
        .submit_ingestion(TableKind::Departments, whole_source(csv))
        .await
        .unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Completed);
    assert_eq!(status.total_rows_seen, 4);
    assert_eq!(status.rows_loaded, 3);
    assert_eq!(status.rows_rejected, 1);

    let sample = &status.rejected_samples[0];
    assert_eq!(sample.reason, RejectReason::TypeError);
    assert_eq!(sample.line, 3);

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fk_enforcement_with_late_parent() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    let report = service
        .batch_write(TableKind::Jobs, vec![vec!["1".into(), "Recruiter".into()]])
        .await
        .unwrap();
    assert_eq!(report.written, 1);

    let employee: Vec<String> = vec![
        "10".into(),
        "Alice".into(),
        "2021-02-03T10:00:00Z".into(),
        "7".into(),
        "1".into(),
    ];

    // Department 7 does not exist yet, the row is refused.
    let report = service
        .batch_write(TableKind::HiredEmployees, vec![employee.clone()])
        .await
        .unwrap();
    assert_eq!(report.written, 0);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].reason, RejectReason::FkViolation);

    let report = service
        .batch_write(
            TableKind::Departments,
            vec![vec!["7".into(), "Supply Chain".into()]],
        )
        .await
        .unwrap();
    assert_eq!(report.written, 1);

    // The same row is loadable once its parent exists.
    let report = service
        .batch_write(TableKind::HiredEmployees, vec![employee])
        .await
        .unwrap();
    assert_eq!(report.written, 1);
    assert!(report.rejected.is_empty());

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_table_tasks_are_mutually_exclusive() {
    init_test_tracing();

    let store = GatedStore::new(MemoryStore::new());
    let service = started_service(store.clone()).await;

    let entered = store.entered();

    let first_csv = "id,name,datetime,department_id,job_id\n1,Alice,2021-02-03T10:00:00Z,,\n";
    let second_csv = "id,name,datetime,department_id,job_id\n2,Bob,2021-05-04T11:00:00Z,,\n";

    let first = service
        .submit_ingestion(TableKind::HiredEmployees, whole_source(first_csv))
        .await
        .unwrap();
    entered.notified().await;

    let second = service
        .submit_ingestion(TableKind::HiredEmployees, whole_source(second_csv))
        .await
        .unwrap();

    // The lane is held by the first task, the second stays queued.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = service.get_task_status(second).await.unwrap();
        assert_eq!(status.phase, TaskPhaseType::Pending);
    }
    let status = service.get_task_status(first).await.unwrap();
    assert_eq!(status.phase, TaskPhaseType::Loading);

    store.release(2);

    let status = wait_for_terminal(&service, first).await;
    assert_eq!(status.phase, TaskPhaseType::Completed);
    let status = wait_for_terminal(&service, second).await;
    assert_eq!(status.phase, TaskPhaseType::Completed);

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_stops_a_stalled_task() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    let task_id = service
        .submit_ingestion(TableKind::Departments, stalled_source())
        .await
        .unwrap();
    wait_for_phase(&service, task_id, TaskPhaseType::Validating).await;

    service.cancel_task(task_id).await.unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Failed);
    assert_eq!(status.last_error.as_deref(), Some("cancelled"));

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_header_mismatch_fails_the_task() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    let task_id = service
        .submit_ingestion(TableKind::Jobs, whole_source("id,department\n1,Engineer\n"))
        .await
        .unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Failed);
    assert_eq!(status.total_rows_seen, 0);

    let reason = status.last_error.unwrap();
    assert!(
        reason.contains("Header mismatch"),
        "unexpected failure reason: {reason}"
    );

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_records_are_reassembled_across_chunk_boundaries() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    // Seven byte pieces cut straight through quoted fields and escaped quotes.
    let csv = "id,department\n1,\"Research, and Development\"\n2,\"Quality \"\"Assurance\"\"\"\n3,Operations\n";
    let task_id = service
        .submit_ingestion(TableKind::Departments, rechunked_source(csv, 7))
        .await
        .unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Completed);
    assert_eq!(status.rows_loaded, 3);
    assert_eq!(status.rows_rejected, 0);

    // A split landing inside an open quote is reassembled the same way.
    let csv = "id,department\n4,\"Customer, Success\"\n";
    let task_id = service
        .submit_ingestion(TableKind::Departments, split_source(csv, &[20]))
        .await
        .unwrap();

    let status = wait_for_terminal(&service, task_id).await;
    assert_eq!(status.phase, TaskPhaseType::Completed);
    assert_eq!(status.rows_loaded, 1);

    service.shutdown_and_wait().await.unwrap();
}
