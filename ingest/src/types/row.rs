use std::borrow::Cow;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SourceBytes, TableKind};

/// A raw CSV record as produced by the record stream, before validation.
///
/// Field values are unquoted and unescaped. The raw source text is retained so rejected
/// records can be surfaced verbatim in task status samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line number at which the record starts in the source stream.
    pub line: u64,
    /// Number of source bytes consumed by this record, terminator included.
    pub bytes: usize,
    /// Source text of the record, without the trailing terminator.
    pub raw: String,
    /// Ordered field values.
    pub fields: Vec<String>,
}

/// A department row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    pub name: String,
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
}

/// A hired employee row.
///
/// The foreign keys are optional. Files in the wild carry hires whose department or job
/// was never recorded, and those rows are loadable as long as the present keys resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiredEmployee {
    pub id: i64,
    pub name: String,
    pub hired_at: DateTime<Utc>,
    pub department_id: Option<i64>,
    pub job_id: Option<i64>,
}

impl HiredEmployee {
    pub fn hire_year(&self) -> i32 {
        self.hired_at.year()
    }

    /// Calendar quarter of the hire timestamp, 1 through 4.
    pub fn hire_quarter(&self) -> u32 {
        (self.hired_at.month() - 1) / 3 + 1
    }
}

/// A typed row bound for one of the target tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableRow {
    Department(Department),
    Job(Job),
    HiredEmployee(HiredEmployee),
}

impl TableRow {
    /// The table this row belongs to.
    pub fn table(&self) -> TableKind {
        match self {
            TableRow::Department(_) => TableKind::Departments,
            TableRow::Job(_) => TableKind::Jobs,
            TableRow::HiredEmployee(_) => TableKind::HiredEmployees,
        }
    }

    /// The primary key of this row.
    pub fn id(&self) -> i64 {
        match self {
            TableRow::Department(department) => department.id,
            TableRow::Job(job) => job.id,
            TableRow::HiredEmployee(employee) => employee.id,
        }
    }

    /// Renders the row as a single CSV line in its table's column layout.
    ///
    /// Typed rows no longer carry their source text, so rows the storage layer refuses
    /// are surfaced through this rendering instead.
    pub fn to_csv(&self) -> String {
        match self {
            TableRow::Department(department) => {
                format!("{},{}", department.id, csv_field(&department.name))
            }
            TableRow::Job(job) => format!("{},{}", job.id, csv_field(&job.name)),
            TableRow::HiredEmployee(employee) => format!(
                "{},{},{},{},{}",
                employee.id,
                csv_field(&employee.name),
                employee.hired_at.format("%Y-%m-%dT%H:%M:%SZ"),
                optional_id(employee.department_id),
                optional_id(employee.job_id),
            ),
        }
    }
}

/// Escapes one CSV field, quoting only when the value requires it.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn optional_id(id: Option<i64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_default()
}

/// A validated row together with the provenance of the record it came from.
///
/// The byte count is carried from the raw record so chunk assembly can cap batches by the
/// amount of source CSV they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRow {
    pub line: u64,
    pub bytes: usize,
    pub row: TableRow,
}

impl SourceBytes for ValidRow {
    fn source_bytes(&self) -> usize {
        self.bytes
    }
}
