use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::reports::{self, AboveMeanReport, DepartmentHires, QuarterCount, QuarterlyHiresReport};
use crate::store::{ConflictPolicy, LoadOutcome, ViewKind, WarehouseStore};
use crate::types::{HiredEmployee, RejectReason, RejectedRow, TableKind, TableRow, ValidRow};

/// One slot of the quarterly aggregate, mirroring a grouped row of the
/// Postgres materialized view. Null keys keep their group here and are
/// dropped at read time by the name join.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QuarterlySlot {
    department_id: Option<i64>,
    job_id: Option<i64>,
    year: i32,
    quarter: u32,
    hires: i64,
}

/// One slot of the per-department yearly aggregate. Hires without a
/// department are excluded when the aggregate is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DepartmentYearSlot {
    department_id: i64,
    year: i32,
    hired: i64,
}

/// Inner state of [`MemoryStore`].
#[derive(Debug, Default)]
struct Inner {
    departments: BTreeMap<i64, String>,
    jobs: BTreeMap<i64, String>,
    hired_employees: BTreeMap<i64, HiredEmployee>,
    /// Quarterly aggregate as of the last refresh. Reports never consult the
    /// base table, so rows loaded after that refresh stay invisible to readers
    /// until the next one.
    quarterly_hires: Vec<QuarterlySlot>,
    /// Per-department yearly aggregate as of the last refresh.
    department_year_hires: Vec<DepartmentYearSlot>,
}

impl Inner {
    fn contains(&self, table: TableKind, id: i64) -> bool {
        match table {
            TableKind::Departments => self.departments.contains_key(&id),
            TableKind::Jobs => self.jobs.contains_key(&id),
            TableKind::HiredEmployees => self.hired_employees.contains_key(&id),
        }
    }
}

/// In-memory warehouse backend.
///
/// [`MemoryStore`] keeps the three target tables and both aggregates in
/// process behind one lock, which makes every batch load and every aggregate
/// swap trivially atomic. Intended for tests and development setups where
/// persistence is not required; all data is lost on process exit.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates a new memory store with empty tables and empty aggregates.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WarehouseStore for MemoryStore {
    async fn ensure_schema(&self) -> IngestResult<()> {
        Ok(())
    }

    async fn load_rows(
        &self,
        table: TableKind,
        rows: Vec<ValidRow>,
        policy: ConflictPolicy,
    ) -> IngestResult<LoadOutcome> {
        let mut inner = self.inner.lock().await;

        let mut outcome = LoadOutcome::default();
        let mut staged: Vec<TableRow> = Vec::with_capacity(rows.len());
        let mut staged_ids: HashSet<i64> = HashSet::with_capacity(rows.len());

        // Classify every row before touching the tables so a batch that errors
        // out leaves no partial writes behind.
        for valid in rows {
            if valid.row.table() != table {
                bail!(
                    ErrorKind::InvalidState,
                    "Batch row targets the wrong table",
                    format!(
                        "row at line {} belongs to {}, batch loads {}",
                        valid.line,
                        valid.row.table(),
                        table
                    )
                );
            }

            let id = valid.row.id();
            if inner.contains(table, id) || staged_ids.contains(&id) {
                match policy {
                    ConflictPolicy::IgnoreOnConflict => outcome.ignored += 1,
                    ConflictPolicy::RejectOnConflict => outcome.rejected.push(RejectedRow::new(
                        valid.line,
                        valid.row.to_csv(),
                        RejectReason::DuplicateKey,
                        format!("id {id} already exists in {table}"),
                    )),
                }
                continue;
            }

            if let TableRow::HiredEmployee(employee) = &valid.row {
                if let Some(error) = missing_reference(&inner, employee) {
                    outcome.rejected.push(RejectedRow::new(
                        valid.line,
                        valid.row.to_csv(),
                        RejectReason::FkViolation,
                        error,
                    ));
                    continue;
                }
            }

            staged_ids.insert(id);
            staged.push(valid.row);
        }

        outcome.inserted = staged.len() as u64;
        for row in staged {
            match row {
                TableRow::Department(department) => {
                    inner.departments.insert(department.id, department.name);
                }
                TableRow::Job(job) => {
                    inner.jobs.insert(job.id, job.name);
                }
                TableRow::HiredEmployee(employee) => {
                    inner.hired_employees.insert(employee.id, employee);
                }
            }
        }

        Ok(outcome)
    }

    async fn refresh_view(&self, view: ViewKind) -> IngestResult<()> {
        let mut inner = self.inner.lock().await;

        match view {
            ViewKind::QuarterlyHires => {
                let mut grouped: BTreeMap<(Option<i64>, Option<i64>, i32, u32), i64> =
                    BTreeMap::new();
                for employee in inner.hired_employees.values() {
                    *grouped
                        .entry((
                            employee.department_id,
                            employee.job_id,
                            employee.hire_year(),
                            employee.hire_quarter(),
                        ))
                        .or_default() += 1;
                }

                inner.quarterly_hires = grouped
                    .into_iter()
                    .map(
                        |((department_id, job_id, year, quarter), hires)| QuarterlySlot {
                            department_id,
                            job_id,
                            year,
                            quarter,
                            hires,
                        },
                    )
                    .collect();
            }
            ViewKind::DepartmentsAboveMean => {
                let mut grouped: BTreeMap<(i64, i32), i64> = BTreeMap::new();
                for employee in inner.hired_employees.values() {
                    let Some(department_id) = employee.department_id else {
                        continue;
                    };

                    *grouped
                        .entry((department_id, employee.hire_year()))
                        .or_default() += 1;
                }

                inner.department_year_hires = grouped
                    .into_iter()
                    .map(|((department_id, year), hired)| DepartmentYearSlot {
                        department_id,
                        year,
                        hired,
                    })
                    .collect();
            }
        }

        Ok(())
    }

    async fn quarterly_hires(&self, year: i32) -> IngestResult<QuarterlyHiresReport> {
        let inner = self.inner.lock().await;

        let counts: Vec<QuarterCount> = inner
            .quarterly_hires
            .iter()
            .filter(|slot| slot.year == year)
            .filter_map(|slot| {
                let department = inner.departments.get(&slot.department_id?)?;
                let job = inner.jobs.get(&slot.job_id?)?;

                Some(QuarterCount {
                    department: department.clone(),
                    job: job.clone(),
                    quarter: slot.quarter,
                    hires: slot.hires,
                })
            })
            .collect();

        Ok(reports::pivot_quarterly(year, counts))
    }

    async fn departments_above_mean(&self, year: i32) -> IngestResult<AboveMeanReport> {
        let inner = self.inner.lock().await;

        let counts: Vec<DepartmentHires> = inner
            .department_year_hires
            .iter()
            .filter(|slot| slot.year == year)
            .filter_map(|slot| {
                let department = inner.departments.get(&slot.department_id)?;

                Some(DepartmentHires {
                    id: slot.department_id,
                    department: department.clone(),
                    hired: slot.hired,
                })
            })
            .collect();

        Ok(reports::departments_above_mean(year, counts))
    }
}

/// Returns a description of the first reference on `employee` that does not
/// resolve, if any. Absent keys are not an error.
fn missing_reference(inner: &Inner, employee: &HiredEmployee) -> Option<String> {
    if let Some(department_id) = employee.department_id {
        if !inner.departments.contains_key(&department_id) {
            return Some(format!("department {department_id} does not exist"));
        }
    }

    if let Some(job_id) = employee.job_id {
        if !inner.jobs.contains_key(&job_id) {
            return Some(format!("job {job_id} does not exist"));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;
    use crate::types::{Department, Job};

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

    fn job(line: u64, id: i64, name: &str) -> ValidRow {
        ValidRow {
            line,
            bytes: 16,
            row: TableRow::Job(Job {
                id,
                name: name.to_owned(),
            }),
        }
    }

    fn employee(
        line: u64,
        id: i64,
        timestamp: &str,
        department_id: Option<i64>,
        job_id: Option<i64>,
    ) -> ValidRow {
        ValidRow {
            line,
            bytes: 64,
            row: TableRow::HiredEmployee(HiredEmployee {
                id,
                name: format!("employee-{id}"),
                hired_at: NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S")
                    .unwrap()
                    .and_utc(),
                department_id,
                job_id,
            }),
        }
    }

    async fn seed_dimensions(store: &MemoryStore) {
        store
            .load_rows(
                TableKind::Departments,
                vec![department(1, 1, "Supply Chain"), department(2, 2, "Staff")],
                ConflictPolicy::RejectOnConflict,
            )
            .await
            .unwrap();
        store
            .load_rows(
                TableKind::Jobs,
                vec![job(1, 1, "Recruiter")],
                ConflictPolicy::RejectOnConflict,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_reference_rejects_row_until_parent_is_loaded() {
        let store = MemoryStore::new();

        let row = employee(1, 10, "2021-02-01T09:00:00", Some(1), Some(1));
        let outcome = store
            .load_rows(
                TableKind::HiredEmployees,
                vec![row.clone()],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].reason, RejectReason::FkViolation);

        seed_dimensions(&store).await;

        let outcome = store
            .load_rows(
                TableKind::HiredEmployees,
                vec![row],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_ignore_policy_makes_reloads_idempotent() {
        let store = MemoryStore::new();
        seed_dimensions(&store).await;

        let batch = vec![
            employee(1, 10, "2021-02-01T09:00:00", Some(1), Some(1)),
            employee(2, 11, "2021-03-01T09:00:00", Some(2), Some(1)),
        ];

        let first = store
            .load_rows(
                TableKind::HiredEmployees,
                batch.clone(),
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.ignored, 0);

        let second = store
            .load_rows(
                TableKind::HiredEmployees,
                batch,
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.ignored, 2);
        assert!(second.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_reject_policy_surfaces_duplicates_without_failing_batch() {
        let store = MemoryStore::new();
        store
            .load_rows(
                TableKind::Departments,
                vec![department(1, 1, "Supply Chain")],
                ConflictPolicy::RejectOnConflict,
            )
            .await
            .unwrap();

        // One conflict with storage, one conflict within the batch, one clean row.
        let outcome = store
            .load_rows(
                TableKind::Departments,
                vec![
                    department(1, 1, "Supply Chain"),
                    department(2, 5, "Staff"),
                    department(3, 5, "Staff"),
                ],
                ConflictPolicy::RejectOnConflict,
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.ignored, 0);
        assert_eq!(outcome.rejected.len(), 2);
        assert!(
            outcome
                .rejected
                .iter()
                .all(|row| row.reason == RejectReason::DuplicateKey)
        );
    }

    #[tokio::test]
    async fn test_wrong_table_batch_is_an_error_and_writes_nothing() {
        let store = MemoryStore::new();

        let result = store
            .load_rows(
                TableKind::Jobs,
                vec![job(1, 1, "Recruiter"), department(2, 1, "Supply Chain")],
                ConflictPolicy::RejectOnConflict,
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidState);

        let outcome = store
            .load_rows(
                TableKind::Jobs,
                vec![job(1, 1, "Recruiter")],
                ConflictPolicy::RejectOnConflict,
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn test_loads_stay_invisible_to_reports_until_refresh() {
        let store = MemoryStore::new();
        seed_dimensions(&store).await;

        store
            .load_rows(
                TableKind::HiredEmployees,
                vec![employee(1, 10, "2021-02-01T09:00:00", Some(1), Some(1))],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();

        let report = store.quarterly_hires(2021).await.unwrap();
        assert_eq!(report.total_rows, 0);

        store.refresh_view(ViewKind::QuarterlyHires).await.unwrap();

        let report = store.quarterly_hires(2021).await.unwrap();
        assert_eq!(report.total_rows, 1);
        assert_eq!(report.data[0].q1, 1);
    }

    #[tokio::test]
    async fn test_reports_match_known_hiring_pattern() {
        let store = MemoryStore::new();
        seed_dimensions(&store).await;

        // 2021 hires: quarter 1 has two for Supply Chain and three for Staff,
        // quarter 3 has one more for Supply Chain.
        store
            .load_rows(
                TableKind::HiredEmployees,
                vec![
                    employee(1, 10, "2021-01-05T09:00:00", Some(1), Some(1)),
                    employee(2, 11, "2021-02-17T09:00:00", Some(1), Some(1)),
                    employee(3, 12, "2021-01-20T09:00:00", Some(2), Some(1)),
                    employee(4, 13, "2021-02-03T09:00:00", Some(2), Some(1)),
                    employee(5, 14, "2021-03-29T09:00:00", Some(2), Some(1)),
                    employee(6, 15, "2021-08-11T09:00:00", Some(1), Some(1)),
                ],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();
        for view in ViewKind::ALL {
            store.refresh_view(view).await.unwrap();
        }

        let quarterly = store.quarterly_hires(2021).await.unwrap();
        assert_eq!(quarterly.total_rows, 2);
        assert_eq!(quarterly.data[0].department, "Staff");
        assert_eq!(
            (
                quarterly.data[0].q1,
                quarterly.data[0].q2,
                quarterly.data[0].q3,
                quarterly.data[0].q4
            ),
            (3, 0, 0, 0)
        );
        assert_eq!(quarterly.data[1].department, "Supply Chain");
        assert_eq!(
            (
                quarterly.data[1].q1,
                quarterly.data[1].q2,
                quarterly.data[1].q3,
                quarterly.data[1].q4
            ),
            (2, 0, 1, 0)
        );

        // Both departments hired three times, so the mean is exactly three and
        // neither is strictly above it.
        let above_mean = store.departments_above_mean(2021).await.unwrap();
        assert_eq!(above_mean.mean_hires, 3.0);
        assert_eq!(above_mean.total_departments, 0);
    }

    #[tokio::test]
    async fn test_hires_without_keys_are_excluded_from_reports() {
        let store = MemoryStore::new();
        seed_dimensions(&store).await;

        store
            .load_rows(
                TableKind::HiredEmployees,
                vec![
                    employee(1, 10, "2021-02-01T09:00:00", Some(1), Some(1)),
                    employee(2, 11, "2021-02-02T09:00:00", None, Some(1)),
                    employee(3, 12, "2021-02-03T09:00:00", Some(1), None),
                ],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();
        for view in ViewKind::ALL {
            store.refresh_view(view).await.unwrap();
        }

        // Only the fully keyed hire appears per department and job.
        let quarterly = store.quarterly_hires(2021).await.unwrap();
        assert_eq!(quarterly.total_rows, 1);
        assert_eq!(quarterly.data[0].q1, 1);

        // The departmentless hire joins neither the counts nor the mean, while
        // the jobless hire still counts for its department.
        let above_mean = store.departments_above_mean(2021).await.unwrap();
        assert_eq!(above_mean.mean_hires, 2.0);
        assert_eq!(above_mean.total_departments, 0);
    }

    #[tokio::test]
    async fn test_refresh_replaces_aggregate_instead_of_appending() {
        let store = MemoryStore::new();
        seed_dimensions(&store).await;

        store
            .load_rows(
                TableKind::HiredEmployees,
                vec![employee(1, 10, "2021-02-01T09:00:00", Some(1), Some(1))],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();
        store.refresh_view(ViewKind::QuarterlyHires).await.unwrap();

        store
            .load_rows(
                TableKind::HiredEmployees,
                vec![employee(2, 11, "2021-02-08T09:00:00", Some(1), Some(1))],
                ConflictPolicy::IgnoreOnConflict,
            )
            .await
            .unwrap();
        store.refresh_view(ViewKind::QuarterlyHires).await.unwrap();

        let report = store.quarterly_hires(2021).await.unwrap();
        assert_eq!(report.total_rows, 1);
        assert_eq!(report.data[0].q1, 2);
    }
}
