use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::store::WarehouseStore;
use crate::types::TableKind;
use crate::workers::ingest::IngestWorker;

/// Runs one lane until shutdown or until every submission side is gone.
///
/// Workers run one at a time in arrival order, which is what serializes tasks aimed at
/// the same table. A failed worker does not stop the lane, the tasks queued behind it
/// still run.
async fn run_lane<S>(
    table: TableKind,
    mut queue_rx: mpsc::UnboundedReceiver<IngestWorker<S>>,
    mut shutdown_rx: ShutdownRx,
) -> IngestResult<()>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    let mut errors = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            maybe_worker = queue_rx.recv() => {
                let Some(worker) = maybe_worker else { break };

                if let Err(err) = worker.run().await {
                    error!(table = %table, error = %err, "ingest worker failed");
                    errors.push(err);
                }
            }
        }
    }

    // Workers still queued at shutdown are drained so every accepted task reaches a
    // terminal phase. Each of them observes the signal before doing any work and
    // records the shutdown as its failure reason.
    queue_rx.close();
    while let Some(worker) = queue_rx.recv().await {
        if let Err(err) = worker.run().await {
            error!(table = %table, error = %err, "ingest worker failed");
            errors.push(err);
        }
    }

    info!(table = %table, "ingest lane stopped");

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}

/// Internal state of [`IngestWorkerPool`].
#[derive(Debug)]
pub struct IngestWorkerPoolInner<S> {
    /// Submission side of every per-table lane.
    lanes: HashMap<TableKind, mpsc::UnboundedSender<IngestWorker<S>>>,
    /// Driver tasks, one per lane.
    join_set: JoinSet<(TableKind, IngestResult<()>)>,
}

impl<S> IngestWorkerPoolInner<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    fn new(shutdown_rx: ShutdownRx) -> Self {
        let mut lanes = HashMap::new();
        let mut join_set = JoinSet::new();

        for table in TableKind::ALL {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();

            let span = tracing::info_span!("ingest_lane", table = %table);
            let lane_shutdown_rx = shutdown_rx.clone();
            join_set.spawn(
                async move { (table, run_lane(table, queue_rx, lane_shutdown_rx).await) }
                    .instrument(span.or_current()),
            );

            lanes.insert(table, queue_tx);
        }

        Self { lanes, join_set }
    }

    /// Queues `worker` on its table's lane.
    pub fn submit(&self, worker: IngestWorker<S>) -> IngestResult<()> {
        let table = worker.table();

        let Some(lane) = self.lanes.get(&table) else {
            bail!(
                ErrorKind::InvalidState,
                "Unknown ingestion lane",
                format!("no lane is registered for table {table}")
            );
        };

        if lane.send(worker).is_err() {
            bail!(
                ErrorKind::InvalidState,
                "Ingest worker pool is stopped",
                format!("the {table} lane no longer accepts tasks")
            );
        }

        debug!(table = %table, "ingest worker queued");

        Ok(())
    }
}

/// Pool of per-table ingestion lanes.
///
/// The pool starts one lane per target table. A lane drains its queue with a dedicated
/// task that runs workers strictly in submission order, so at most one task per table
/// is active at a time while distinct tables make progress in parallel.
///
/// Cloning the pool is cheap and every clone submits into the same lanes.
#[derive(Debug, Clone)]
pub struct IngestWorkerPool<S> {
    inner: Arc<Mutex<IngestWorkerPoolInner<S>>>,
}

impl<S> IngestWorkerPool<S>
where
    S: WarehouseStore + Clone + Send + Sync + 'static,
{
    /// Creates the pool and starts its lanes.
    ///
    /// The lanes stop in response to `shutdown_rx`, draining queued workers so every
    /// accepted task still reaches a terminal phase.
    pub fn new(shutdown_rx: ShutdownRx) -> Self {
        Self {
            inner: Arc::new(Mutex::new(IngestWorkerPoolInner::new(shutdown_rx))),
        }
    }

    /// Queues a worker on its table's lane.
    ///
    /// Fails once the pool has shut down and the lane no longer accepts tasks.
    pub async fn submit(&self, worker: IngestWorker<S>) -> IngestResult<()> {
        let inner = self.inner.lock().await;
        inner.submit(worker)
    }

    /// Waits for every lane to stop and aggregates worker errors.
    ///
    /// Lanes stop in response to the shutdown signal the pool was created with, so
    /// this is meant to be awaited as part of service shutdown. Worker errors at this
    /// point are infrastructure faults, data problems are recorded on the task status
    /// instead of surfacing here.
    pub async fn wait_all(&self) -> IngestResult<()> {
        let mut errors = Vec::new();

        loop {
            // The lock is scoped to a single `join_next` so late submissions are not
            // starved while lanes wind down.
            let result = {
                let mut inner = self.inner.lock().await;
                inner.join_set.join_next().await
            };

            let Some(result) = result else {
                break;
            };

            match result {
                Ok((table, Ok(()))) => {
                    debug!(table = %table, "ingest lane finished");
                }
                Ok((table, Err(err))) => {
                    error!(table = %table, error = %err, "ingest lane finished with errors");
                    errors.push(err);
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("ingest lane task was cancelled");
                    } else {
                        errors.push(ingest_error!(
                            ErrorKind::IngestWorkerPanic,
                            "Ingest lane panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

impl<S> Deref for IngestWorkerPool<S> {
    type Target = Mutex<IngestWorkerPoolInner<S>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
