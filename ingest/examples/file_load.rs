//! Ingestion example: CSV files into the in-memory warehouse.
//!
//! Streams the provided CSV files into their tables, waits for every task to
//! reach a terminal phase, and prints the yearly reports.
//!
//! Usage:
//!     cargo run --example file_load -- \
//!         --departments ./departments.csv \
//!         --jobs ./jobs.csv \
//!         --hired-employees ./hired_employees.csv \
//!         --year 2021

use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use ingest::error::IngestError;
use ingest::service::IngestService;
use ingest::store::memory::MemoryStore;
use ingest::types::{TableKind, TaskId};
use ingest::workers::ingest::ByteStream;
use ingest_config::shared::ServiceConfig;
use ingest_telemetry::init_tracing;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSV file with department rows.
    #[arg(long)]
    departments: Option<PathBuf>,

    /// CSV file with job rows.
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// CSV file with hired employee rows.
    #[arg(long)]
    hired_employees: Option<PathBuf>,

    /// Year the reports are computed for.
    #[arg(long, default_value = "2021")]
    year: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing()?;

    main_impl().await
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut service = IngestService::new(ServiceConfig::default(), MemoryStore::new());

    info!("starting ingestion service");
    service.start().await?;

    let uploads = [
        (TableKind::Departments, args.departments),
        (TableKind::Jobs, args.jobs),
        (TableKind::HiredEmployees, args.hired_employees),
    ];

    for (table, path) in uploads {
        let Some(path) = path else {
            continue;
        };

        info!(table = %table, path = %path.display(), "submitting file");

        let task_id = service
            .submit_ingestion(table, file_source(&path).await?)
            .await?;
        wait_for_terminal(&service, task_id).await?;
    }

    let quarterly = service.get_quarterly_hires(args.year).await?;
    info!(
        year = args.year,
        rows = quarterly.total_rows,
        "quarterly hires report ready"
    );
    println!("{}", serde_json::to_string_pretty(&quarterly)?);

    let above_mean = service.get_departments_above_mean_csv(args.year).await?;
    println!("{above_mean}");

    info!("shutting down ingestion service");
    service.shutdown_and_wait().await?;

    info!("ingestion service shutdown complete");
    Ok(())
}

async fn file_source(path: &Path) -> Result<ByteStream, Box<dyn Error>> {
    let file = File::open(path).await?;
    let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(IngestError::from));

    Ok(Box::pin(stream))
}

async fn wait_for_terminal(
    service: &IngestService<MemoryStore>,
    task_id: TaskId,
) -> Result<(), Box<dyn Error>> {
    loop {
        let status = service.get_task_status(task_id).await?;
        if status.phase.is_terminal() {
            info!(
                task_id = %task_id,
                table = %status.table,
                phase = %status.phase,
                rows_loaded = status.rows_loaded,
                rows_rejected = status.rows_rejected,
                "ingestion task finished"
            );

            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
