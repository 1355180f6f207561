use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;

/// Target tables accepted by the ingestion service.
///
/// The set is closed. Every submitted file or batch declares exactly one target table and
/// rows are interpreted against that table's column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Departments,
    Jobs,
    HiredEmployees,
}

impl TableKind {
    /// All target tables, in foreign key dependency order.
    pub const ALL: [TableKind; 3] = [
        TableKind::Departments,
        TableKind::Jobs,
        TableKind::HiredEmployees,
    ];

    pub fn as_static_str(&self) -> &'static str {
        match self {
            TableKind::Departments => "departments",
            TableKind::Jobs => "jobs",
            TableKind::HiredEmployees => "hired_employees",
        }
    }

    /// Column names expected in the CSV header line, in order.
    pub fn expected_columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Departments => &["id", "department"],
            TableKind::Jobs => &["id", "job"],
            TableKind::HiredEmployees => {
                &["id", "name", "datetime", "department_id", "job_id"]
            }
        }
    }

    /// Number of fields every record for this table must carry.
    pub fn arity(&self) -> usize {
        self.expected_columns().len()
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_static_str())
    }
}

impl FromStr for TableKind {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s {
            "departments" => Ok(TableKind::Departments),
            "jobs" => Ok(TableKind::Jobs),
            "hired_employees" => Ok(TableKind::HiredEmployees),
            other => Err(ingest_error!(
                ErrorKind::InvalidRequest,
                "Unknown target table",
                format!("table `{other}` is not part of the ingestion schema")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_round_trip() {
        for table in TableKind::ALL {
            let parsed: TableKind = table.as_static_str().parse().unwrap();
            assert_eq!(parsed, table);
        }
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let err = "employees".parse::<TableKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_arity_matches_expected_columns() {
        assert_eq!(TableKind::Departments.arity(), 2);
        assert_eq!(TableKind::Jobs.arity(), 2);
        assert_eq!(TableKind::HiredEmployees.arity(), 5);
    }
}
