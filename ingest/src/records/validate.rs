use chrono::{DateTime, NaiveDateTime, Utc};

use crate::bail;
use crate::error::{ErrorKind, IngestResult};
use crate::types::{
    Department, HiredEmployee, Job, RawRecord, RejectReason, RejectedRow, TableKind, TableRow,
    ValidRow,
};

/// Timestamp layout accepted in addition to RFC 3339, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Validates raw CSV records against one target table layout.
///
/// Validation is pure: no I/O, no side effects, and the same record always produces the
/// same outcome. A record either becomes a typed row or a [`RejectedRow`] carrying the
/// first constraint it violated.
#[derive(Debug, Clone, Copy)]
pub struct RowValidator {
    table: TableKind,
}

impl RowValidator {
    pub fn new(table: TableKind) -> Self {
        Self { table }
    }

    /// Checks a header record against the expected column names of the target table.
    ///
    /// Matching is exact and case-sensitive. A mismatch fails the whole submission, a
    /// file with the wrong header would reject every single row anyway.
    pub fn validate_header(&self, record: &RawRecord) -> IngestResult<()> {
        let expected = self.table.expected_columns();

        if record.fields.len() != expected.len()
            || record.fields.iter().zip(expected).any(|(got, want)| got != want)
        {
            bail!(
                ErrorKind::SchemaError,
                "Header mismatch",
                format!(
                    "expected header `{}` for table `{}`, got `{}`",
                    expected.join(","),
                    self.table,
                    record.raw
                )
            );
        }

        Ok(())
    }

    /// Validates one record, producing a typed row or a rejection.
    pub fn validate(&self, record: RawRecord) -> Result<ValidRow, RejectedRow> {
        let arity = self.table.arity();
        if record.fields.len() != arity {
            return Err(RejectedRow::new(
                record.line,
                record.raw,
                RejectReason::SchemaError,
                format!("expected {arity} fields, got {}", record.fields.len()),
            ));
        }

        let row = match self.table {
            TableKind::Departments => {
                let id = parse_id(&record, "id", &record.fields[0])?;
                let name = parse_name(&record, "department", &record.fields[1])?;

                TableRow::Department(Department { id, name })
            }
            TableKind::Jobs => {
                let id = parse_id(&record, "id", &record.fields[0])?;
                let name = parse_name(&record, "job", &record.fields[1])?;

                TableRow::Job(Job { id, name })
            }
            TableKind::HiredEmployees => validate_employee_row(&record)?,
        };

        Ok(ValidRow {
            line: record.line,
            bytes: record.bytes,
            row,
        })
    }
}

fn validate_employee_row(record: &RawRecord) -> Result<TableRow, RejectedRow> {
    let id = parse_id(record, "id", &record.fields[0])?;
    let name = parse_name(record, "name", &record.fields[1])?;
    let hired_at = parse_timestamp(record, &record.fields[2])?;
    let department_id = parse_optional_id(record, "department_id", &record.fields[3])?;
    let job_id = parse_optional_id(record, "job_id", &record.fields[4])?;

    Ok(TableRow::HiredEmployee(HiredEmployee {
        id,
        name,
        hired_at,
        department_id,
        job_id,
    }))
}

fn type_error(record: &RawRecord, error: String) -> RejectedRow {
    RejectedRow::new(record.line, record.raw.clone(), RejectReason::TypeError, error)
}

fn parse_id(record: &RawRecord, column: &str, value: &str) -> Result<i64, RejectedRow> {
    let id: i64 = value
        .parse()
        .map_err(|_| type_error(record, format!("column `{column}` is not an integer: `{value}`")))?;

    if id <= 0 {
        return Err(type_error(
            record,
            format!("column `{column}` must be strictly positive, got {id}"),
        ));
    }

    Ok(id)
}

fn parse_optional_id(
    record: &RawRecord,
    column: &str,
    value: &str,
) -> Result<Option<i64>, RejectedRow> {
    if value.is_empty() {
        return Ok(None);
    }

    parse_id(record, column, value).map(Some)
}

fn parse_name(record: &RawRecord, column: &str, value: &str) -> Result<String, RejectedRow> {
    if value.is_empty() {
        return Err(type_error(record, format!("column `{column}` must not be empty")));
    }

    Ok(value.to_owned())
}

fn parse_timestamp(record: &RawRecord, value: &str) -> Result<DateTime<Utc>, RejectedRow> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    // Files in the wild carry offset-less timestamps, read as UTC.
    if let Ok(timestamp) = NaiveDateTime::parse_from_str(value, NAIVE_TIMESTAMP_FORMAT) {
        return Ok(timestamp.and_utc());
    }

    Err(type_error(
        record,
        format!("column `datetime` is not an ISO-8601 timestamp: `{value}`"),
    ))
}
