use std::fmt;

use serde::Serialize;

/// Classification of why a record was excluded from loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The record does not match the declared table layout, wrong field count included.
    SchemaError,
    /// A field failed type validation, for example a non-numeric id or a malformed
    /// timestamp.
    TypeError,
    /// The primary key already exists and the load policy rejects conflicts.
    DuplicateKey,
    /// A present foreign key does not resolve to an existing parent row.
    FkViolation,
}

impl RejectReason {
    pub fn as_static_str(&self) -> &'static str {
        match self {
            RejectReason::SchemaError => "schema_error",
            RejectReason::TypeError => "type_error",
            RejectReason::DuplicateKey => "duplicate_key",
            RejectReason::FkViolation => "fk_violation",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_static_str())
    }
}

/// A record excluded from loading, with its provenance and the reason it was dropped.
///
/// Rejections never abort the surrounding task. They are counted, sampled into task
/// status, and the remaining rows keep flowing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    /// 1-based line number in the source stream, or the 1-based row position for rows
    /// submitted directly as a batch.
    pub line: u64,
    /// Source text of the offending record.
    pub raw: String,
    pub reason: RejectReason,
    /// Human readable explanation of the failure.
    pub error: String,
}

impl RejectedRow {
    pub fn new(
        line: u64,
        raw: impl Into<String>,
        reason: RejectReason,
        error: impl Into<String>,
    ) -> RejectedRow {
        RejectedRow {
            line,
            raw: raw.into(),
            reason,
            error: error.into(),
        }
    }
}
