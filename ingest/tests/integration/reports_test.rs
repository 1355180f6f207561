use std::time::Duration;

use ingest::reports::{AboveMeanReport, DepartmentHires, QuarterlyHiresReport, QuarterlyHiresRow};
use ingest::service::IngestService;
use ingest::store::WarehouseStore;
use ingest::store::memory::MemoryStore;
use ingest::test_utils::csv::whole_source;
use ingest::types::TableKind;
use ingest_telemetry::init_test_tracing;
use tokio::time::Instant;

use crate::common::{started_service, wait_for_terminal};

/// Polls the quarterly report until the refresh scheduler has caught up to the
/// expected number of rows.
async fn quarterly_with_rows<S>(
    service: &IngestService<S>,
    year: i32,
    rows: usize,
) -> QuarterlyHiresReport
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        let report = service.get_quarterly_hires(year).await.unwrap();
        if report.total_rows == rows {
            return report;
        }

        assert!(
            Instant::now() < deadline,
            "aggregates were not refreshed in time, last report: {report:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls the above-mean report until its mean reflects the expected value.
///
/// The two aggregates refresh independently, so a fresh quarterly report does not
/// imply the department aggregate caught up yet.
async fn above_mean_with_mean<S>(
    service: &IngestService<S>,
    year: i32,
    mean_hires: f64,
) -> AboveMeanReport
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        let report = service.get_departments_above_mean(year).await.unwrap();
        if report.mean_hires == mean_hires {
            return report;
        }

        assert!(
            Instant::now() < deadline,
            "aggregates were not refreshed in time, last report: {report:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reports_match_known_dataset() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    service
        .batch_write(
            TableKind::Departments,
            vec![
                vec!["1".into(), "Supply Chain".into()],
                vec!["2".into(), "Staff".into()],
            ],
        )
        .await
        .unwrap();
    service
        .batch_write(TableKind::Jobs, vec![vec!["1".into(), "Recruiter".into()]])
        .await
        .unwrap();

    // Supply Chain hires twice in Q1 and once in Q3, Staff hires three times in Q1.
    let hires = vec![
        vec!["1".into(), "Avery".into(), "2021-01-05T09:00:00Z".into(), "1".into(), "1".into()],
        vec!["2".into(), "Blake".into(), "2021-02-14T09:00:00Z".into(), "1".into(), "1".into()],
        vec!["3".into(), "Casey".into(), "2021-08-20T09:00:00Z".into(), "1".into(), "1".into()],
        vec!["4".into(), "Drew".into(), "2021-01-09T09:00:00Z".into(), "2".into(), "1".into()],
        vec!["5".into(), "Emery".into(), "2021-02-11T09:00:00Z".into(), "2".into(), "1".into()],
        vec!["6".into(), "Finley".into(), "2021-03-30T09:00:00Z".into(), "2".into(), "1".into()],
    ];
    let report = service
        .batch_write(TableKind::HiredEmployees, hires)
        .await
        .unwrap();
    assert_eq!(report.written, 6);

    let quarterly = quarterly_with_rows(&service, 2021, 2).await;
    assert_eq!(
        quarterly.data,
        vec![
            QuarterlyHiresRow {
                department: "Staff".into(),
                job: "Recruiter".into(),
                q1: 3,
                q2: 0,
                q3: 0,
                q4: 0,
            },
            QuarterlyHiresRow {
                department: "Supply Chain".into(),
                job: "Recruiter".into(),
                q1: 2,
                q2: 0,
                q3: 1,
                q4: 0,
            },
        ]
    );

    // Both departments hired exactly the mean of three, strictly-above leaves none.
    let above = above_mean_with_mean(&service, 2021, 3.0).await;
    assert!(above.data.is_empty());
    assert_eq!(above.total_departments, 0);

    let csv = service.get_departments_above_mean_csv(2021).await.unwrap();
    assert_eq!(csv, "id,department,hired\n");

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streamed_ingestion_reaches_reports() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    for (table, csv) in [
        (TableKind::Departments, "id,department\n1,Engineering\n"),
        (TableKind::Jobs, "id,job\n1,Engineer\n"),
        (
            TableKind::HiredEmployees,
            "id,name,datetime,department_id,job_id\n1,Avery,2021-05-10T08:00:00Z,1,1\n",
        ),
    ] {
        let task_id = service
            .submit_ingestion(table, whole_source(csv))
            .await
            .unwrap();
        let status = wait_for_terminal(&service, task_id).await;
        assert_eq!(status.rows_loaded, 1, "load failed for table {table}");
    }

    let quarterly = quarterly_with_rows(&service, 2021, 1).await;
    assert_eq!(
        quarterly.data,
        vec![QuarterlyHiresRow {
            department: "Engineering".into(),
            job: "Engineer".into(),
            q1: 0,
            q2: 1,
            q3: 0,
            q4: 0,
        }]
    );

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_above_mean_report_ranks_departments() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

    service
        .batch_write(
            TableKind::Departments,
            vec![
                vec!["1".into(), "Engineering".into()],
                vec!["2".into(), "Product".into()],
                vec!["3".into(), "Support".into()],
            ],
        )
        .await
        .unwrap();
    service
        .batch_write(TableKind::Jobs, vec![vec!["1".into(), "Engineer".into()]])
        .await
        .unwrap();

    // Engineering hires four, the others one each, the mean lands at two.
    let mut hires = Vec::new();
    for id in 1..=4 {
        hires.push(vec![
            id.to_string(),
            format!("Eng {id}"),
            "2021-03-01T09:00:00Z".into(),
            "1".into(),
            "1".into(),
        ]);
    }
    hires.push(vec![
        "5".into(),
        "Parker".into(),
        "2021-06-01T09:00:00Z".into(),
        "2".into(),
        "1".into(),
    ]);
    hires.push(vec![
        "6".into(),
        "Quinn".into(),
        "2021-09-01T09:00:00Z".into(),
        "3".into(),
        "1".into(),
    ]);

    let report = service
        .batch_write(TableKind::HiredEmployees, hires)
        .await
        .unwrap();
    assert_eq!(report.written, 6);

    let above = above_mean_with_mean(&service, 2021, 2.0).await;
    assert_eq!(
        above.data,
        vec![DepartmentHires {
            id: 1,
            department: "Engineering".into(),
            hired: 4,
        }]
    );

    let csv = service.get_departments_above_mean_csv(2021).await.unwrap();
    assert_eq!(csv, "id,department,hired\n1,Engineering,4\n");

    service.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_report_reads_never_observe_a_partial_refresh() {
    init_test_tracing();

    let service = started_service(MemoryStore::new()).await;

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
            vec![
                vec!["1".into(), "Avery".into(), "2021-01-05T09:00:00Z".into(), "1".into(), "1".into()],
                vec!["2".into(), "Blake".into(), "2021-02-14T09:00:00Z".into(), "1".into(), "1".into()],
            ],
        )
        .await
        .unwrap();

    let report = quarterly_with_rows(&service, 2021, 1).await;
    assert_eq!(report.data[0].q1, 2);

    // Three more Q1 hires land while readers keep querying. Every observation must
    // show either the old count or the new one, a torn value means the swap was not
    // atomic.
    service
        .batch_write(
            TableKind::HiredEmployees,
            vec![
                vec!["3".into(), "Casey".into(), "2021-01-20T09:00:00Z".into(), "1".into(), "1".into()],
                vec!["4".into(), "Drew".into(), "2021-02-01T09:00:00Z".into(), "1".into(), "1".into()],
                vec!["5".into(), "Emery".into(), "2021-03-11T09:00:00Z".into(), "1".into(), "1".into()],
            ],
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let report = service.get_quarterly_hires(2021).await.unwrap();
        let q1 = report.data.first().map(|row| row.q1).unwrap_or(0);
        assert!(q1 == 2 || q1 == 5, "observed a torn quarterly count: {q1}");

        if q1 == 5 {
            break;
        }

        assert!(
            Instant::now() < deadline,
            "aggregates were not refreshed in time"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    service.shutdown_and_wait().await.unwrap();
}
