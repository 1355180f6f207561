//! Bulk loading of validated batches into the warehouse.
//!
//! [`BulkLoader`] is the single write path to storage, shared by the
//! asynchronous pipeline and the synchronous batch-write call. It adds a
//! bounded execution time on top of the store so a wedged storage backend
//! surfaces as a retryable error instead of a hung task.

use std::time::Duration;

use tracing::debug;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::store::{ConflictPolicy, LoadOutcome, WarehouseStore};
use crate::types::{TableKind, ValidRow};

/// Executes batch loads against the warehouse with a bounded execution time.
#[derive(Debug, Clone)]
pub struct BulkLoader<S> {
    store: S,
    timeout: Duration,
}

impl<S> BulkLoader<S>
where
    S: WarehouseStore,
{
    /// Creates a loader that allows each load call at most `timeout`.
    pub fn new(store: S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Loads one batch atomically under the configured conflict policy.
    ///
    /// An elapsed timeout maps to [`ErrorKind::StorageTimeout`], which the
    /// retry layer treats as transient. The store may have committed before
    /// the deadline passed, so retries must use an idempotent policy.
    pub async fn load(
        &self,
        table: TableKind,
        rows: Vec<ValidRow>,
        policy: ConflictPolicy,
    ) -> IngestResult<LoadOutcome> {
        let row_count = rows.len();

        let load = self.store.load_rows(table, rows, policy);
        let outcome = match tokio::time::timeout(self.timeout, load).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ingest_error!(
                    ErrorKind::StorageTimeout,
                    "Batch load timed out",
                    format!(
                        "load of {row_count} rows into {table} exceeded {}ms",
                        self.timeout.as_millis()
                    )
                ));
            }
        };

        debug!(
            table = table.as_static_str(),
            rows = row_count,
            inserted = outcome.inserted,
            ignored = outcome.ignored,
            rejected = outcome.rejected.len(),
            "batch load finished"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::{self, AboveMeanReport, QuarterlyHiresReport};
    use crate::store::ViewKind;
    use crate::store::memory::MemoryStore;
    use crate::types::{Department, TableRow};

    /// Store whose loads never finish, for exercising the deadline.
    #[derive(Debug, Clone)]
    struct StalledStore;

    impl WarehouseStore for StalledStore {
        async fn ensure_schema(&self) -> IngestResult<()> {
            Ok(())
        }

        async fn load_rows(
            &self,
            _table: TableKind,
            _rows: Vec<ValidRow>,
            _policy: ConflictPolicy,
        ) -> IngestResult<LoadOutcome> {
            std::future::pending().await
        }

        async fn refresh_view(&self, _view: ViewKind) -> IngestResult<()> {
            Ok(())
        }

        async fn quarterly_hires(&self, year: i32) -> IngestResult<QuarterlyHiresReport> {
            Ok(reports::pivot_quarterly(year, Vec::new()))
        }

        async fn departments_above_mean(&self, year: i32) -> IngestResult<AboveMeanReport> {
            Ok(reports::departments_above_mean(year, Vec::new()))
        }
    }

    fn department(line: u64, id: i64, name: &str) -> ValidRow {
        ValidRow {
            line,
            bytes: 16,
            row: TableRow::Department(Department {
                id,
                name: name.to_owned(),
            }),
        }
    }

    #[tokio::test]
    async fn test_load_passes_outcome_through() {
        let loader = BulkLoader::new(MemoryStore::new(), Duration::from_secs(5));

        let outcome = loader
            .load(
                TableKind::Departments,
                vec![department(1, 1, "Supply Chain")],
                ConflictPolicy::RejectOnConflict,
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_load_times_out_as_transient() {
        let loader = BulkLoader::new(StalledStore, Duration::from_millis(20));

        let error = loader
            .load(
                TableKind::Departments,
                vec![department(1, 1, "Supply Chain")],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::StorageTimeout);
    }
}
