use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::IngestResult;
use crate::reports::{AboveMeanReport, QuarterlyHiresReport};
use crate::types::{RejectedRow, TableKind, ValidRow};

/// How a bulk load treats rows whose primary key already exists.
///
/// The asynchronous pipeline loads with [`ConflictPolicy::IgnoreOnConflict`] so
/// chunk retries are idempotent. The synchronous batch-write path loads with
/// [`ConflictPolicy::RejectOnConflict`] so duplicate submissions are visible to
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Conflicting rows become per-row rejections with a duplicate key reason.
    RejectOnConflict,
    /// Conflicting rows are skipped and reported as ignored.
    IgnoreOnConflict,
}

/// Counts returned by one bulk load call.
///
/// Rows in `rejected` were refused individually and did not prevent the rest
/// of the batch from committing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Rows newly written by this call.
    pub inserted: u64,
    /// Rows skipped because their key was already present.
    pub ignored: u64,
    /// Rows refused one by one, with reasons.
    pub rejected: Vec<RejectedRow>,
}

/// Materialized aggregates served to report queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// Hire counts per department, job, and calendar quarter.
    QuarterlyHires,
    /// Hire counts per department and year, behind the above-mean report.
    DepartmentsAboveMean,
}

impl ViewKind {
    /// All refreshable aggregates.
    pub const ALL: [ViewKind; 2] = [ViewKind::QuarterlyHires, ViewKind::DepartmentsAboveMean];

    /// Returns the static string representation of the view kind.
    pub fn as_static_str(&self) -> &'static str {
        match self {
            ViewKind::QuarterlyHires => "quarterly_hires",
            ViewKind::DepartmentsAboveMean => "departments_above_mean",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_static_str())
    }
}

/// Trait for the warehouse the pipeline loads into and reports read from.
///
/// Implementations must be cheaply cloneable handles over shared state, safe to
/// call from concurrent loader tasks.
pub trait WarehouseStore {
    /// Creates the target tables and aggregates when they are missing.
    ///
    /// Called once at service start and safe to call repeatedly.
    fn ensure_schema(&self) -> impl Future<Output = IngestResult<()>> + Send;

    /// Atomically loads one batch of validated rows into `table`.
    ///
    /// Either every surviving row of the batch becomes visible or none does.
    /// Rows refused by per-row checks, duplicate keys under
    /// [`ConflictPolicy::RejectOnConflict`] or foreign keys that do not
    /// resolve, are returned in the outcome and do not fail the batch. Under
    /// [`ConflictPolicy::IgnoreOnConflict`], reloading an already committed
    /// batch reports its rows as ignored instead of writing duplicates.
    fn load_rows(
        &self,
        table: TableKind,
        rows: Vec<ValidRow>,
        policy: ConflictPolicy,
    ) -> impl Future<Output = IngestResult<LoadOutcome>> + Send;

    /// Rebuilds the aggregate behind `view` and swaps it into place atomically.
    ///
    /// Readers observe either the previous aggregate or the new one in full,
    /// never a mixture.
    fn refresh_view(&self, view: ViewKind) -> impl Future<Output = IngestResult<()>> + Send;

    /// Quarterly hires report for `year`, served from the quarterly aggregate.
    ///
    /// Hires whose department or job key is null or no longer resolves are
    /// excluded from the report.
    fn quarterly_hires(
        &self,
        year: i32,
    ) -> impl Future<Output = IngestResult<QuarterlyHiresReport>> + Send;

    /// Departments hiring above the yearly mean, served from the per-department
    /// aggregate.
    fn departments_above_mean(
        &self,
        year: i32,
    ) -> impl Future<Output = IngestResult<AboveMeanReport>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_kind_round_trips_through_serde() {
        let rendered = serde_json::to_string(&ViewKind::DepartmentsAboveMean).unwrap();
        assert_eq!(rendered, "\"departments_above_mean\"");

        let parsed: ViewKind = serde_json::from_str("\"quarterly_hires\"").unwrap();
        assert_eq!(parsed, ViewKind::QuarterlyHires);
    }

    #[test]
    fn test_view_kind_display_matches_static_str() {
        for view in ViewKind::ALL {
            assert_eq!(view.to_string(), view.as_static_str());
        }
    }
}
