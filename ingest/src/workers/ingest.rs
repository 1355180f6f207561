use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use ingest_config::shared::ServiceConfig;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::concurrency::stream::ChunkStream;
use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;
use crate::load::BulkLoader;
use crate::records::rows::{RowOutcome, RowStream};
use crate::records::stream::RecordStream;
use crate::records::validate::RowValidator;
use crate::refresh::RefreshHandle;
use crate::state::task::{CANCELLED_REASON, SHUTDOWN_REASON, TaskPhase, TaskState};
use crate::store::{ConflictPolicy, LoadOutcome, ViewKind, WarehouseStore};
use crate::types::{TableKind, ValidRow};
use crate::workers::retry;

/// Raw CSV bytes of one submission, produced incrementally by the caller.
pub type ByteStream = Pin<Box<dyn Stream<Item = IngestResult<Bytes>> + Send>>;

/// One bounded group of row outcomes traveling from the producer to the loader.
type Chunk = Vec<IngestResult<RowOutcome>>;

/// Why the chunk consumption loop ended.
enum Exit {
    Completed,
    Cancelled,
    Shutdown,
    Error(IngestError),
}

/// Worker that drives a single ingestion task to a terminal phase.
///
/// [`IngestWorker`] owns the whole pipeline of one submission: it decodes the byte
/// stream into CSV records, validates them against the target table, groups the
/// outcomes into bounded chunks, and loads chunks with bounded fan-out and retries for
/// transient storage failures. Decoding runs in a producer task connected to the loader
/// through a bounded queue, so a slow warehouse backpressures the stream instead of
/// buffering the file.
///
/// Every exit path records a terminal phase on the task: completion after the refresh
/// handoff, or failure carrying the reason, cancellation and shutdown included.
pub struct IngestWorker<S> {
    config: Arc<ServiceConfig>,
    state: TaskState,
    table: TableKind,
    cancel_rx: ShutdownRx,
    shutdown_rx: ShutdownRx,
    loader: BulkLoader<S>,
    refresh: RefreshHandle,
    source: ByteStream,
}

impl<S> IngestWorker<S> {
    /// Creates a new worker for one accepted submission.
    ///
    /// `cancel_rx` is the receiver created together with the task state, so
    /// cancellations issued while the task is still queued are observed before any
    /// work starts.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServiceConfig>,
        state: TaskState,
        table: TableKind,
        cancel_rx: ShutdownRx,
        shutdown_rx: ShutdownRx,
        loader: BulkLoader<S>,
        refresh: RefreshHandle,
        source: ByteStream,
    ) -> Self {
        Self {
            config,
            state,
            table,
            cancel_rx,
            shutdown_rx,
            loader,
            refresh,
            source,
        }
    }

    /// Table this worker loads into, used for lane routing.
    pub fn table(&self) -> TableKind {
        self.table
    }
}

impl<S> IngestWorker<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    /// Runs the task to a terminal phase.
    ///
    /// Returns `Err` only for infrastructure faults such as a panicked subtask. Data
    /// problems, including fatal ones, are reported through the task status and yield
    /// `Ok`.
    pub async fn run(self) -> IngestResult<()> {
        let task_id = self.state.lock().await.task_id();
        let span = tracing::info_span!(
            "ingest_worker",
            task_id = %task_id,
            table = %self.table,
        );

        self.drive().instrument(span.or_current()).await
    }

    async fn drive(self) -> IngestResult<()> {
        let Self {
            config,
            state,
            table,
            mut cancel_rx,
            mut shutdown_rx,
            loader,
            refresh,
            source,
        } = self;

        // A cancellation or shutdown that raced ahead of the worker is honored before
        // any byte is read.
        if cancel_rx.has_changed().unwrap_or(false) {
            finish_failed(&state, CANCELLED_REASON).await;

            return Ok(());
        }

        if shutdown_rx.has_changed().unwrap_or(false) {
            finish_failed(&state, SHUTDOWN_REASON).await;

            return Ok(());
        }

        state.lock().await.set(TaskPhase::Validating);

        let ingest_config = &config.ingest;
        let validator = RowValidator::new(table);
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Chunk>(ingest_config.queue_depth);

        // Producer half: decode, validate and chunk the byte stream. The cancellation
        // signal stops it at the next chunk boundary, and also covers a source that
        // stays silent forever.
        let producer: JoinHandle<()> = {
            let records = RecordStream::wrap(source);
            let rows = RowStream::wrap(records, validator, ingest_config.csv_has_header);
            let chunks = ChunkStream::wrap(rows, config.batch.clone(), cancel_rx.clone());
            let mut producer_cancel_rx = cancel_rx.clone();

            tokio::spawn(
                async move {
                    tokio::pin!(chunks);

                    loop {
                        tokio::select! {
                            biased;

                            _ = producer_cancel_rx.changed() => break,

                            maybe_chunk = chunks.next() => {
                                match maybe_chunk {
                                    Some(ShutdownResult::Ok(chunk)) => {
                                        if chunk_tx.send(chunk).await.is_err() {
                                            break;
                                        }
                                    }
                                    // Rows buffered at the cut never reached the
                                    // loader, the task is stopping anyway.
                                    Some(ShutdownResult::Shutdown(_)) => break,
                                    None => break,
                                }
                            }
                        }
                    }
                }
                .in_current_span(),
            )
        };

        // Consumer half: hand chunks to the loader with bounded fan-out.
        let mut loads: JoinSet<IngestResult<()>> = JoinSet::new();
        let mut loading = false;
        let mut exit = Exit::Completed;

        'consume: loop {
            // Bound the fan-out before pulling the next chunk.
            while loads.len() >= ingest_config.load_fanout {
                let Some(joined) = loads.join_next().await else {
                    break;
                };

                if let Err(err) = flatten_load(joined) {
                    exit = Exit::Error(err);
                    break 'consume;
                }
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    // Reuse the cancellation signal to stop the producer, the reason
                    // recorded below still distinguishes the two.
                    state.lock().await.request_cancel();
                    exit = Exit::Shutdown;
                    break 'consume;
                }

                _ = cancel_rx.changed() => {
                    exit = Exit::Cancelled;
                    break 'consume;
                }

                maybe_chunk = chunk_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break 'consume;
                    };

                    if !loading {
                        loading = true;
                        state.lock().await.set(TaskPhase::Loading);
                    }

                    let load = ChunkLoad {
                        state: state.clone(),
                        loader: loader.clone(),
                        table,
                        max_attempts: ingest_config.retry_max_attempts,
                        base_delay: Duration::from_millis(ingest_config.retry_base_delay_ms),
                        sample_limit: ingest_config.rejected_sample_limit,
                        cancel_rx: cancel_rx.clone(),
                        shutdown_rx: shutdown_rx.clone(),
                    };

                    loads.spawn(load.run(chunk).in_current_span());
                }
            }
        }

        // Loads that are already in flight run to completion regardless of why the
        // loop ended.
        let mut load_error: Option<IngestError> = None;
        while let Some(joined) = loads.join_next().await {
            if let Err(err) = flatten_load(joined) {
                if load_error.is_none() {
                    load_error = Some(err);
                }
            }
        }

        // Unblock and join the producer. Closing the channel wakes a producer stuck on
        // a full queue, the cancellation signal covers everything else.
        if !matches!(exit, Exit::Completed) || load_error.is_some() {
            state.lock().await.request_cancel();
        }

        chunk_rx.close();
        drop(chunk_rx);

        if let Err(err) = producer.await {
            let err = ingest_error!(ErrorKind::IngestWorkerPanic, "Chunk producer panicked", err);
            finish_failed(&state, err.description().to_owned()).await;

            return Err(err);
        }

        match exit {
            Exit::Shutdown => {
                finish_failed(&state, SHUTDOWN_REASON).await;

                Ok(())
            }
            Exit::Cancelled => {
                finish_failed(&state, CANCELLED_REASON).await;

                Ok(())
            }
            Exit::Error(err) => fail_with_error(&state, err).await,
            Exit::Completed => match load_error {
                Some(err) => fail_with_error(&state, err).await,
                None => {
                    complete(&state, &refresh).await;

                    Ok(())
                }
            },
        }
    }
}

/// One chunk load with retries, spawned per chunk with bounded fan-out.
struct ChunkLoad<S> {
    state: TaskState,
    loader: BulkLoader<S>,
    table: TableKind,
    max_attempts: u32,
    base_delay: Duration,
    sample_limit: usize,
    cancel_rx: ShutdownRx,
    shutdown_rx: ShutdownRx,
}

impl<S> ChunkLoad<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    async fn run(mut self, chunk: Chunk) -> IngestResult<()> {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();

        for item in chunk {
            match item {
                Ok(Ok(row)) => valid.push(row),
                Ok(Err(rejection)) => rejected.push(rejection),
                // A fatal stream error travels inside the chunk and fails the task.
                Err(err) => return Err(err),
            }
        }

        {
            let mut state = self.state.lock().await;
            state.record_seen((valid.len() + rejected.len()) as u64);
            state.record_rejected(rejected, self.sample_limit);
        }

        if valid.is_empty() {
            return Ok(());
        }

        let outcome = self.load_with_retries(valid).await?;

        let mut state = self.state.lock().await;
        state.record_loaded(outcome.inserted + outcome.ignored);
        state.record_rejected(outcome.rejected, self.sample_limit);

        Ok(())
    }

    async fn load_with_retries(&mut self, rows: Vec<ValidRow>) -> IngestResult<LoadOutcome> {
        let mut failed_attempts = 0u32;

        loop {
            // Reloading the same chunk stays idempotent under this policy: rows that
            // made it in before a transient failure are counted as ignored instead of
            // erroring or duplicating.
            let result = self
                .loader
                .load(self.table, rows.clone(), ConflictPolicy::IgnoreOnConflict)
                .await;

            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            failed_attempts += 1;

            if failed_attempts >= self.max_attempts || !retry::is_transient(&err) {
                return Err(err);
            }

            let delay = retry::backoff_delay(self.base_delay, failed_attempts);

            warn!(
                table = %self.table,
                error = %err,
                failed_attempts,
                delay_ms = delay.as_millis() as u64,
                "chunk load failed, retrying",
            );

            // Stop retrying immediately on cancellation or shutdown instead of
            // sleeping through it.
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    bail!(
                        ErrorKind::TaskCancelled,
                        "Chunk retry interrupted by shutdown"
                    );
                }

                _ = self.cancel_rx.changed() => {
                    bail!(
                        ErrorKind::TaskCancelled,
                        "Chunk retry interrupted by cancellation"
                    );
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn finish_failed(state: &TaskState, reason: impl Into<String>) {
    state.lock().await.set(TaskPhase::Failed {
        reason: reason.into(),
    });
}

async fn fail_with_error(state: &TaskState, err: IngestError) -> IngestResult<()> {
    warn!(error = %err, "ingestion task failed");

    // The status reason stays a single human-readable line, diagnostics live in the
    // log line above.
    let reason = match err.detail() {
        Some(detail) => format!("{}: {detail}", err.description()),
        None => err.description().to_owned(),
    };

    finish_failed(state, reason).await;

    // Panics are infrastructural and surface to the pool. Data errors are fully
    // reported through the task status.
    if err.kind() == ErrorKind::IngestWorkerPanic {
        return Err(err);
    }

    Ok(())
}

async fn complete(state: &TaskState, refresh: &RefreshHandle) {
    state.lock().await.set(TaskPhase::Refreshing);

    // Both aggregates read the tables this pipeline loads. Completion only waits for
    // the requests to be queued, not for the refreshes themselves.
    for view in ViewKind::ALL {
        refresh.request_refresh(view).await;
    }

    let mut inner = state.lock().await;
    let status = inner.snapshot();
    inner.set(TaskPhase::Completed);
    drop(inner);

    info!(
        total_rows_seen = status.total_rows_seen,
        rows_loaded = status.rows_loaded,
        rows_rejected = status.rows_rejected,
        "ingestion task completed",
    );
}

fn flatten_load(joined: Result<IngestResult<()>, JoinError>) -> IngestResult<()> {
    Ok(joined.map_err(|err| {
        if err.is_cancelled() {
            ingest_error!(ErrorKind::TaskCancelled, "Chunk load task was cancelled", err)
        } else {
            ingest_error!(ErrorKind::IngestWorkerPanic, "Chunk load task panicked", err)
        }
    })??)
}
