//! Analytics report types and the aggregation routines behind them.
//!
//! Reads are served from materialized aggregates that the refresh scheduler
//! rebuilds out of band, see [`crate::refresh`]. Store backends supply raw
//! per-group hire counts and the functions here pivot, rank, and render them,
//! which keeps the in-memory and Postgres backends byte-for-byte consistent.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;

/// Smallest year accepted by report queries.
pub const MIN_REPORT_YEAR: i32 = 2000;

/// Largest year accepted by report queries.
pub const MAX_REPORT_YEAR: i32 = 2030;

/// Validates that a report year falls within the accepted range.
pub fn validate_report_year(year: i32) -> IngestResult<()> {
    if !(MIN_REPORT_YEAR..=MAX_REPORT_YEAR).contains(&year) {
        return Err(ingest_error!(
            ErrorKind::InvalidRequest,
            "Report year out of range",
            format!("year {year} is not between {MIN_REPORT_YEAR} and {MAX_REPORT_YEAR}")
        ));
    }

    Ok(())
}

/// Unpivoted hire count for one department, job, and quarter, as produced by
/// the store backends from the quarterly aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarterCount {
    pub department: String,
    pub job: String,
    pub quarter: u32,
    pub hires: i64,
}

/// One row of the quarterly hires report, with hires pivoted into one column
/// per quarter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarterlyHiresRow {
    pub department: String,
    pub job: String,
    #[serde(rename = "Q1")]
    pub q1: i64,
    #[serde(rename = "Q2")]
    pub q2: i64,
    #[serde(rename = "Q3")]
    pub q3: i64,
    #[serde(rename = "Q4")]
    pub q4: i64,
}

/// Quarterly hires report for a single year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarterlyHiresReport {
    pub year: i32,
    pub data: Vec<QuarterlyHiresRow>,
    pub total_rows: usize,
}

/// Hire count for one department over a full year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepartmentHires {
    pub id: i64,
    pub department: String,
    pub hired: i64,
}

/// Departments whose yearly hire count exceeds the mean across departments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AboveMeanReport {
    pub year: i32,
    pub mean_hires: f64,
    pub data: Vec<DepartmentHires>,
    pub total_departments: usize,
}

/// Pivots per-quarter hire counts into one report row per department and job
/// pair, zero-filling quarters without hires.
///
/// Rows are ordered by department name, then job name, byte-wise. Counts with
/// a quarter outside `1..=4` are discarded.
pub fn pivot_quarterly(year: i32, counts: Vec<QuarterCount>) -> QuarterlyHiresReport {
    let mut grouped: BTreeMap<(String, String), [i64; 4]> = BTreeMap::new();
    for count in counts {
        if !(1..=4).contains(&count.quarter) {
            continue;
        }

        let quarters = grouped.entry((count.department, count.job)).or_default();
        quarters[(count.quarter - 1) as usize] += count.hires;
    }

    let data: Vec<QuarterlyHiresRow> = grouped
        .into_iter()
        .map(|((department, job), [q1, q2, q3, q4])| QuarterlyHiresRow {
            department,
            job,
            q1,
            q2,
            q3,
            q4,
        })
        .collect();

    QuarterlyHiresReport {
        year,
        total_rows: data.len(),
        data,
    }
}

/// Keeps the departments whose yearly hire count is strictly greater than the
/// arithmetic mean across all departments that hired at least once that year.
///
/// The caller passes one entry per department with hires; the mean is computed
/// over exactly those entries and reported even when no department clears it.
/// Surviving rows are ordered by hire count descending, ties broken by
/// department id ascending.
pub fn departments_above_mean(year: i32, counts: Vec<DepartmentHires>) -> AboveMeanReport {
    let mean_hires = if counts.is_empty() {
        0.0
    } else {
        let total: i64 = counts.iter().map(|count| count.hired).sum();
        total as f64 / counts.len() as f64
    };

    let mut data: Vec<DepartmentHires> = counts
        .into_iter()
        .filter(|count| (count.hired as f64) > mean_hires)
        .collect();
    data.sort_by(|a, b| b.hired.cmp(&a.hired).then(a.id.cmp(&b.id)));

    AboveMeanReport {
        year,
        mean_hires,
        total_departments: data.len(),
        data,
    }
}

/// Renders the above-mean report as CSV with an `id,department,hired` header
/// and one line per department.
pub fn render_above_mean_csv(report: &AboveMeanReport) -> IngestResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    writer.write_record(["id", "department", "hired"])?;
    for row in &report.data {
        writer.write_record([
            row.id.to_string().as_str(),
            row.department.as_str(),
            row.hired.to_string().as_str(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|err| {
        ingest_error!(ErrorKind::SerializationError, "CSV report rendering failed", err)
    })?;

    Ok(String::from_utf8(bytes)?)
}
