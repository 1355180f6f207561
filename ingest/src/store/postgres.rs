use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ingest_config::shared::PgConnectionConfig;
use sqlx::PgPool;
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::reports::{self, AboveMeanReport, DepartmentHires, QuarterCount, QuarterlyHiresReport};
use crate::store::{ConflictPolicy, LoadOutcome, ViewKind, WarehouseStore};
use crate::types::{RejectReason, RejectedRow, TableKind, TableRow, ValidRow};

/// Maximum number of connections in the pool.
///
/// Sized for the configured chunk load fan-out plus concurrent report queries.
const MAX_POOL_CONNECTIONS: u32 = 8;

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Statements that bring an empty database up to the warehouse schema.
///
/// Every statement is idempotent, so the list can be replayed on every start.
/// Both aggregates carry a unique index because concurrent refresh requires
/// one.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    create table if not exists departments (
        id bigint primary key,
        department text not null
    )
    "#,
    r#"
    create table if not exists jobs (
        id bigint primary key,
        job text not null
    )
    "#,
    r#"
    create table if not exists hired_employees (
        id bigint primary key,
        name text not null,
        hire_dt timestamptz not null,
        hire_year int not null,
        department_id bigint references departments (id),
        job_id bigint references jobs (id)
    )
    "#,
    "create index if not exists idx_hired_employees_hire_dt on hired_employees (hire_dt)",
    "create index if not exists idx_hired_employees_year_dept on hired_employees (hire_year, department_id)",
    "create index if not exists idx_hired_employees_dept_job_dt on hired_employees (department_id, job_id, hire_dt)",
    r#"
    create materialized view if not exists mv_hires_q as
    select
        department_id,
        job_id,
        date_trunc('quarter', hire_dt)::date as quarter,
        count(*) as hires
    from hired_employees
    group by department_id, job_id, date_trunc('quarter', hire_dt)::date
    "#,
    "create unique index if not exists mv_hires_q_key on mv_hires_q (department_id, job_id, quarter)",
    r#"
    create materialized view if not exists mv_dept_mean as
    select
        department_id,
        extract(year from hire_dt)::int as year,
        count(*) as hired
    from hired_employees
    where department_id is not null
    group by department_id, extract(year from hire_dt)::int
    "#,
    "create unique index if not exists mv_dept_mean_key on mv_dept_mean (department_id, year)",
];

/// Creates a lazily connected pool with automatic idle connection cleanup.
///
/// The function returns immediately without establishing any connections.
/// Connections are created on demand when queries execute and closed again
/// after sitting idle, which suits a workload of bursty bulk loads separated
/// by quiet stretches.
fn create_warehouse_pool(config: &PgConnectionConfig) -> PgPool {
    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(MAX_POOL_CONNECTIONS)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(config.to_connect_options())
}

/// Postgres warehouse backend.
///
/// Bulk loads run as single multi-row inserts inside one transaction per
/// batch, and both report aggregates are Postgres materialized views refreshed
/// concurrently so readers keep seeing the previous contents until the new
/// ones are swapped in.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store connecting lazily with the supplied configuration.
    pub fn new(config: &PgConnectionConfig) -> Self {
        Self {
            pool: create_warehouse_pool(config),
        }
    }

    /// Creates a store on top of an existing connection pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl WarehouseStore for PostgresStore {
    async fn ensure_schema(&self) -> IngestResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("warehouse schema ensured");

        Ok(())
    }

    async fn load_rows(
        &self,
        table: TableKind,
        rows: Vec<ValidRow>,
        policy: ConflictPolicy,
    ) -> IngestResult<LoadOutcome> {
        for valid in &rows {
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
        }

        let mut tx = self.pool.begin().await?;

        // Per-row checks run against the same transaction the insert commits
        // in, so a batch observes one consistent view of the tables.
        let existing = existing_ids(&mut tx, table, &rows).await?;
        let (missing_departments, missing_jobs) = if table == TableKind::HiredEmployees {
            missing_references(&mut tx, &rows).await?
        } else {
            (HashSet::new(), HashSet::new())
        };

        let mut outcome = LoadOutcome::default();
        let mut staged: Vec<&ValidRow> = Vec::with_capacity(rows.len());
        let mut staged_ids: HashSet<i64> = HashSet::with_capacity(rows.len());

        for valid in &rows {
            let id = valid.row.id();
            if existing.contains(&id) || staged_ids.contains(&id) {
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
                let missing_department = employee
                    .department_id
                    .is_some_and(|id| missing_departments.contains(&id));
                let missing_job = employee.job_id.is_some_and(|id| missing_jobs.contains(&id));

                if missing_department || missing_job {
                    let error = if missing_department {
                        format!(
                            "department {} does not exist",
                            employee.department_id.unwrap_or_default()
                        )
                    } else {
                        format!("job {} does not exist", employee.job_id.unwrap_or_default())
                    };

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
            staged.push(valid);
        }

        let inserted = insert_staged(&mut tx, table, &staged).await?;

        // Rows that conflicted between our pre-check and the insert itself
        // surface as the difference against the staged count.
        let raced = staged.len() as u64 - inserted;
        match policy {
            ConflictPolicy::IgnoreOnConflict => outcome.ignored += raced,
            ConflictPolicy::RejectOnConflict => {
                if raced > 0 {
                    bail!(
                        ErrorKind::SerializationConflict,
                        "Batch lost a write race",
                        format!("{raced} rows were written concurrently during the load")
                    );
                }
            }
        }
        outcome.inserted = inserted;

        tx.commit().await?;

        Ok(outcome)
    }

    async fn refresh_view(&self, view: ViewKind) -> IngestResult<()> {
        let statement = match view {
            ViewKind::QuarterlyHires => "refresh materialized view concurrently mv_hires_q",
            ViewKind::DepartmentsAboveMean => "refresh materialized view concurrently mv_dept_mean",
        };

        debug!(view = %view, "refreshing materialized view");
        sqlx::query(statement).execute(&self.pool).await?;

        Ok(())
    }

    async fn quarterly_hires(&self, year: i32) -> IngestResult<QuarterlyHiresReport> {
        let rows = sqlx::query(
            r#"
            select
                d.department,
                j.job,
                extract(quarter from h.quarter)::int as quarter,
                h.hires
            from mv_hires_q h
            join departments d on h.department_id = d.id
            join jobs j on h.job_id = j.id
            where extract(year from h.quarter)::int = $1
            order by d.department, j.job
            "#,
        )
        .bind(year)
        .fetch_all(&self.pool)
        .await?;

        let counts = rows
            .into_iter()
            .map(|row| QuarterCount {
                department: row.get("department"),
                job: row.get("job"),
                quarter: row.get::<i32, _>("quarter").max(0) as u32,
                hires: row.get("hires"),
            })
            .collect();

        Ok(reports::pivot_quarterly(year, counts))
    }

    async fn departments_above_mean(&self, year: i32) -> IngestResult<AboveMeanReport> {
        let rows = sqlx::query(
            r#"
            select d.id, d.department, m.hired
            from mv_dept_mean m
            join departments d on m.department_id = d.id
            where m.year = $1
            "#,
        )
        .bind(year)
        .fetch_all(&self.pool)
        .await?;

        let counts = rows
            .into_iter()
            .map(|row| DepartmentHires {
                id: row.get("id"),
                department: row.get("department"),
                hired: row.get("hired"),
            })
            .collect();

        Ok(reports::departments_above_mean(year, counts))
    }
}

/// Returns the primary keys from `rows` that are already present in `table`.
async fn existing_ids(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: TableKind,
    rows: &[ValidRow],
) -> IngestResult<HashSet<i64>> {
    let ids: Vec<i64> = rows.iter().map(|valid| valid.row.id()).collect();

    let statement = match table {
        TableKind::Departments => "select id from departments where id = any($1)",
        TableKind::Jobs => "select id from jobs where id = any($1)",
        TableKind::HiredEmployees => "select id from hired_employees where id = any($1)",
    };

    let found = sqlx::query(statement)
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await?;

    Ok(found.into_iter().map(|row| row.get("id")).collect())
}

/// Returns the department and job keys referenced by `rows` that do not
/// resolve against their tables.
async fn missing_references(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    rows: &[ValidRow],
) -> IngestResult<(HashSet<i64>, HashSet<i64>)> {
    let mut department_ids: HashSet<i64> = HashSet::new();
    let mut job_ids: HashSet<i64> = HashSet::new();

    for valid in rows {
        if let TableRow::HiredEmployee(employee) = &valid.row {
            department_ids.extend(employee.department_id);
            job_ids.extend(employee.job_id);
        }
    }

    let mut missing_departments: HashSet<i64> = department_ids.iter().copied().collect();
    if !department_ids.is_empty() {
        let ids: Vec<i64> = department_ids.into_iter().collect();
        let found = sqlx::query("select id from departments where id = any($1)")
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await?;
        for row in found {
            missing_departments.remove(&row.get("id"));
        }
    }

    let mut missing_jobs: HashSet<i64> = job_ids.iter().copied().collect();
    if !job_ids.is_empty() {
        let ids: Vec<i64> = job_ids.into_iter().collect();
        let found = sqlx::query("select id from jobs where id = any($1)")
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await?;
        for row in found {
            missing_jobs.remove(&row.get("id"));
        }
    }

    Ok((missing_departments, missing_jobs))
}

/// Inserts the staged rows as one multi-row statement and returns how many
/// were newly written.
async fn insert_staged(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: TableKind,
    staged: &[&ValidRow],
) -> IngestResult<u64> {
    if staged.is_empty() {
        return Ok(0);
    }

    let inserted = match table {
        TableKind::Departments | TableKind::Jobs => {
            let mut ids: Vec<i64> = Vec::with_capacity(staged.len());
            let mut names: Vec<&str> = Vec::with_capacity(staged.len());
            for valid in staged {
                match &valid.row {
                    TableRow::Department(department) => {
                        ids.push(department.id);
                        names.push(&department.name);
                    }
                    TableRow::Job(job) => {
                        ids.push(job.id);
                        names.push(&job.name);
                    }
                    TableRow::HiredEmployee(_) => {}
                }
            }

            let statement = match table {
                TableKind::Departments => {
                    r#"
                    insert into departments (id, department)
                    select * from unnest($1::bigint[], $2::text[]) as t (id, department)
                    on conflict (id) do nothing
                    returning id
                    "#
                }
                _ => {
                    r#"
                    insert into jobs (id, job)
                    select * from unnest($1::bigint[], $2::text[]) as t (id, job)
                    on conflict (id) do nothing
                    returning id
                    "#
                }
            };

            sqlx::query(statement)
                .bind(&ids)
                .bind(&names)
                .fetch_all(&mut **tx)
                .await?
                .len() as u64
        }
        TableKind::HiredEmployees => {
            let mut ids: Vec<i64> = Vec::with_capacity(staged.len());
            let mut names: Vec<&str> = Vec::with_capacity(staged.len());
            let mut hired_at: Vec<DateTime<Utc>> = Vec::with_capacity(staged.len());
            let mut hire_years: Vec<i32> = Vec::with_capacity(staged.len());
            let mut department_ids: Vec<Option<i64>> = Vec::with_capacity(staged.len());
            let mut job_ids: Vec<Option<i64>> = Vec::with_capacity(staged.len());
            for valid in staged {
                if let TableRow::HiredEmployee(employee) = &valid.row {
                    ids.push(employee.id);
                    names.push(&employee.name);
                    hired_at.push(employee.hired_at);
                    hire_years.push(employee.hire_year());
                    department_ids.push(employee.department_id);
                    job_ids.push(employee.job_id);
                }
            }

            sqlx::query(
                r#"
                insert into hired_employees (id, name, hire_dt, hire_year, department_id, job_id)
                select * from unnest(
                    $1::bigint[], $2::text[], $3::timestamptz[], $4::int[], $5::bigint[], $6::bigint[]
                ) as t (id, name, hire_dt, hire_year, department_id, job_id)
                on conflict (id) do nothing
                returning id
                "#,
            )
            .bind(&ids)
            .bind(&names)
            .bind(&hired_at)
            .bind(&hire_years)
            .bind(&department_ids)
            .bind(&job_ids)
            .fetch_all(&mut **tx)
            .await?
            .len() as u64
        }
    };

    Ok(inserted)
}
