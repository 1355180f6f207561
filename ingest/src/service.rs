use std::sync::Arc;
use std::time::Duration;

use ingest_config::shared::ServiceConfig;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::load::BulkLoader;
use crate::records::validate::RowValidator;
use crate::refresh::{RefreshHandle, RefreshScheduler, RefreshWorkerHandle};
use crate::reports::{self, AboveMeanReport, QuarterlyHiresReport};
use crate::state::registry::TaskRegistry;
use crate::state::task::{TaskState, TaskStatus};
use crate::store::{ConflictPolicy, ViewKind, WarehouseStore};
use crate::types::{RawRecord, RejectedRow, TableKind, TaskId};
use crate::workers::ingest::{ByteStream, IngestWorker};
use crate::workers::pool::IngestWorkerPool;

/// Maximum number of rows accepted by a single synchronous batch write.
pub const BATCH_WRITE_MAX_ROWS: usize = 1000;

/// Outcome of a synchronous batch write.
///
/// Row-scoped problems never fail the call. Validation failures and rows the
/// storage layer refused are returned together in `rejected` while the
/// surviving rows are committed atomically.
#[derive(Debug, Clone, Serialize)]
pub struct BatchWriteReport {
    /// Rows written by this call.
    pub written: u64,
    /// Rows refused, with reasons. Validation and storage rejections combined.
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug)]
enum ServiceState<S> {
    NotStarted,
    Started {
        pool: IngestWorkerPool<S>,
        refresh: RefreshHandle,
        refresh_worker: RefreshWorkerHandle,
    },
}

/// Facade over the whole ingestion system.
///
/// The service owns the per-table worker lanes, the task registry, and the aggregate
/// refresh scheduler, and exposes the operations collaborators integrate against:
/// streaming submissions, synchronous batch writes, task status and cancellation, and
/// the two analytics reports.
#[derive(Debug)]
pub struct IngestService<S> {
    config: Arc<ServiceConfig>,
    store: S,
    registry: TaskRegistry,
    state: ServiceState<S>,
    shutdown_tx: ShutdownTx,
}

impl<S> IngestService<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    pub fn new(config: ServiceConfig, store: S) -> Self {
        // We create a watch channel of unit types since this is just used to notify
        // all subscribers that shutdown is needed.
        //
        // Here we are not taking the `shutdown_rx` since we will just extract it from
        // the `shutdown_tx` via the `subscribe` method. This is done to make the code
        // cleaner.
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config: Arc::new(config),
            store,
            registry: TaskRegistry::new(),
            state: ServiceState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Validates the configuration, bootstraps the warehouse schema, and starts the
    /// worker lanes and the refresh scheduler.
    pub async fn start(&mut self) -> IngestResult<()> {
        if matches!(self.state, ServiceState::Started { .. }) {
            bail!(
                ErrorKind::InvalidState,
                "Ingestion service already started",
                "`start` may only be called once per service instance"
            );
        }

        info!("starting ingestion service");

        self.config.validate().map_err(|err| {
            ingest_error!(ErrorKind::ConfigError, "Invalid service configuration", err)
        })?;

        // The schema bootstrap is idempotent, restarting converges on the same layout.
        self.store.ensure_schema().await?;

        let scheduler = RefreshScheduler::new(
            self.store.clone(),
            Duration::from_millis(self.config.refresh.cooldown_ms),
            self.shutdown_tx.subscribe(),
        );
        let refresh = scheduler.handle();
        let refresh_worker = scheduler.spawn();

        let pool = IngestWorkerPool::new(self.shutdown_tx.subscribe());

        self.state = ServiceState::Started {
            pool,
            refresh,
            refresh_worker,
        };

        Ok(())
    }

    /// Accepts a CSV byte stream for ingestion into `table`.
    ///
    /// The submission is queued on the table's lane and the task id is returned
    /// immediately, with the task in [`crate::state::task::TaskPhase::Pending`] until
    /// the lane picks it up. Progress and the final outcome are observable through
    /// [`IngestService::get_task_status`].
    pub async fn submit_ingestion(
        &self,
        table: TableKind,
        source: ByteStream,
    ) -> IngestResult<TaskId> {
        let ServiceState::Started { pool, refresh, .. } = &self.state else {
            bail!(
                ErrorKind::InvalidState,
                "Ingestion service is not started",
                "submissions are only accepted between start and shutdown"
            );
        };

        let task_id = TaskId::new();
        let (state, cancel_rx) = TaskState::new(task_id, table);

        let worker = IngestWorker::new(
            self.config.clone(),
            state.clone(),
            table,
            cancel_rx,
            self.shutdown_tx.subscribe(),
            self.loader(),
            refresh.clone(),
            source,
        );

        pool.submit(worker).await?;
        self.registry.register(state).await;

        debug!(task_id = %task_id, table = %table, "ingestion task accepted");

        Ok(task_id)
    }

    /// Returns a snapshot of a task's phase, counters, and rejected row samples.
    pub async fn get_task_status(&self, task_id: TaskId) -> IngestResult<TaskStatus> {
        self.registry.task_status(task_id).await
    }

    /// Requests cooperative cancellation of a task.
    ///
    /// The worker stops at the next chunk boundary, in-flight chunk loads still run to
    /// completion. Cancelling a task that already reached a terminal phase is a no-op.
    pub async fn cancel_task(&self, task_id: TaskId) -> IngestResult<()> {
        self.registry.cancel(task_id).await
    }

    /// Synchronously writes up to [`BATCH_WRITE_MAX_ROWS`] rows into `table`.
    ///
    /// Each row is a list of field values in the table's column order, validated with
    /// the same rules as streamed CSV records. Surviving rows are committed as one
    /// atomic batch under [`ConflictPolicy::RejectOnConflict`], so duplicates of
    /// already stored keys come back as rejections instead of being silently skipped.
    pub async fn batch_write(
        &self,
        table: TableKind,
        rows: Vec<Vec<String>>,
    ) -> IngestResult<BatchWriteReport> {
        let ServiceState::Started { refresh, .. } = &self.state else {
            bail!(
                ErrorKind::InvalidState,
                "Ingestion service is not started",
                "batch writes are only accepted between start and shutdown"
            );
        };

        if rows.is_empty() {
            bail!(
                ErrorKind::InvalidRequest,
                "Empty batch",
                "a batch write must carry at least one row"
            );
        }

        if rows.len() > BATCH_WRITE_MAX_ROWS {
            bail!(
                ErrorKind::InvalidRequest,
                "Batch too large",
                format!(
                    "a batch write carries at most {BATCH_WRITE_MAX_ROWS} rows, got {}",
                    rows.len()
                )
            );
        }

        let validator = RowValidator::new(table);

        let mut valid = Vec::new();
        let mut rejected = Vec::new();
        for (index, fields) in rows.into_iter().enumerate() {
            let raw = fields.join(",");
            let record = RawRecord {
                line: index as u64 + 1,
                bytes: 0,
                raw,
                fields,
            };

            match validator.validate(record) {
                Ok(row) => valid.push(row),
                Err(rejection) => rejected.push(rejection),
            }
        }

        let mut written = 0;
        if !valid.is_empty() {
            let outcome = self
                .loader()
                .load(table, valid, ConflictPolicy::RejectOnConflict)
                .await?;

            written = outcome.inserted;
            rejected.extend(outcome.rejected);
        }

        if written > 0 {
            for view in ViewKind::ALL {
                refresh.request_refresh(view).await;
            }
        }

        debug!(
            table = %table,
            written,
            rejected = rejected.len(),
            "batch write finished"
        );

        Ok(BatchWriteReport { written, rejected })
    }

    /// Quarterly hires report for `year`, served from the quarterly aggregate.
    pub async fn get_quarterly_hires(&self, year: i32) -> IngestResult<QuarterlyHiresReport> {
        reports::validate_report_year(year)?;

        self.store.quarterly_hires(year).await
    }

    /// Departments hiring above the yearly mean, served from the per-department
    /// aggregate.
    pub async fn get_departments_above_mean(&self, year: i32) -> IngestResult<AboveMeanReport> {
        reports::validate_report_year(year)?;

        self.store.departments_above_mean(year).await
    }

    /// The above-mean report rendered as CSV, one line per qualifying department.
    pub async fn get_departments_above_mean_csv(&self, year: i32) -> IngestResult<String> {
        let report = self.get_departments_above_mean(year).await?;

        reports::render_above_mean_csv(&report)
    }

    pub fn shutdown(&self) {
        info!("trying to shut down the ingestion service");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the ingestion service: {}", err);
            return;
        }

        info!("shutdown signal successfully sent to all workers");
    }

    /// Waits for the worker lanes and the refresh scheduler to stop.
    ///
    /// Lanes and the scheduler only stop in response to the shutdown signal, so this
    /// completes once [`IngestService::shutdown`] has been issued. Queued tasks are
    /// drained to a terminal phase first, none are left pending.
    pub async fn wait(self) -> IngestResult<()> {
        let ServiceState::Started {
            pool,
            refresh: _,
            refresh_worker,
        } = self.state
        else {
            info!("ingestion service was not started, nothing to wait for");

            return Ok(());
        };

        let mut errors = vec![];

        info!("waiting for ingest lanes to complete");

        // Workers hand refresh requests to the scheduler while they wind down, so the
        // lanes are joined before the refresh worker.
        let lanes_result = pool.wait_all().await;
        if let Err(err) = lanes_result {
            // We naively use the `kinds` as number of errors.
            let errors_number = err.kinds().len();

            errors.push(err);

            info!("{} ingest workers failed with an error", errors_number);
        }

        info!("waiting for the refresh scheduler to complete");

        let refresh_result = refresh_worker.wait().await;
        if let Err(err) = refresh_result {
            errors.push(err);
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    pub async fn shutdown_and_wait(self) -> IngestResult<()> {
        self.shutdown();
        self.wait().await
    }

    fn loader(&self) -> BulkLoader<S> {
        BulkLoader::new(
            self.store.clone(),
            Duration::from_millis(self.config.ingest.chunk_timeout_ms),
        )
    }
}
