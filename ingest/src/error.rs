//! Error types and result definitions for ingestion operations.
//!
//! Provides an error system with classification, aggregation, and captured diagnostic
//! metadata. The [`IngestError`] type supports single errors, errors with additional
//! detail, and multiple aggregated errors for complex failure scenarios.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for ingestion operations using [`IngestError`] as the error type.
pub type IngestResult<T> = Result<T, IngestError>;

/// Detailed payload stored for single [`IngestError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

impl ErrorPayload {
    fn new(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
        location: &'static Location<'static>,
        backtrace: Arc<Backtrace>,
    ) -> Self {
        Self {
            kind,
            description,
            detail,
            source,
            location,
            backtrace,
        }
    }
}

/// Main error type for ingestion operations.
///
/// [`IngestError`] can represent single errors, errors with additional detail, or
/// multiple aggregated errors. The design allows for rich error information while
/// maintaining ergonomic usage patterns.
#[derive(Debug, Clone)]
pub struct IngestError {
    repr: ErrorRepr,
}

/// Internal representation of error data.
///
/// Users should not interact with this type directly but use [`IngestError`] methods
/// instead.
#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors.
    ///
    /// This variant is mainly useful to capture multiple worker failures.
    Many {
        errors: Vec<IngestError>,
        location: &'static Location<'static>,
    },
}

/// Specific categories of errors that can occur during ingestion operations.
///
/// Error kinds are organized by functional area and failure mode. Transiency is
/// decided where retries happen, see [`crate::workers::retry`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Request errors
    InvalidRequest,
    MissingTask,

    // Schema & data errors
    SchemaError,
    ConversionError,
    InvalidData,

    // Storage errors that resolve on retry
    StorageConnectionFailed,
    SerializationConflict,
    StorageTimeout,

    // Storage errors that do not
    StorageQueryFailed,
    StorageFull,

    // Configuration, IO & serialization errors
    ConfigError,
    IoError,
    SerializationError,
    DeserializationError,

    // State & workflow errors
    InvalidState,
    TaskCancelled,
    IngestWorkerPanic,
    RefreshWorkerPanic,

    // Unknown / Uncategorized
    Unknown,
}

impl IngestError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    ///
    /// For single errors, returns a vector with one element. For multiple errors,
    /// returns a flattened vector of all error kinds.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the static description of this error.
    ///
    /// For multiple errors, returns the description of the first error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the detailed error information if available.
    ///
    /// For multiple errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified
    /// instance.
    ///
    /// The stored source is preserved across clones and exposed via
    /// [`error::Error::source`]. Has no effect when called on aggregated errors because
    /// aggregates forward the first contained error as their source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.set_source(Some(Arc::new(source)));
        self
    }

    /// Creates an [`IngestError`] from its components.
    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        let location = Location::caller();
        let backtrace = Arc::new(Backtrace::capture());

        IngestError {
            repr: ErrorRepr::Single(ErrorPayload::new(
                kind,
                description,
                detail,
                source,
                location,
                backtrace,
            )),
        }
    }

    /// Sets the source for this [`IngestError`].
    fn set_source(&mut self, source: Option<Arc<dyn error::Error + Send + Sync>>) {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = source;
        }
    }
}

impl PartialEq for IngestError {
    fn eq(&self, other: &IngestError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Hash for IngestError {
    /// Hashes the error using only its stable identifying components.
    ///
    /// Only hashes the error kind and static description, intentionally excluding
    /// location, detail, source, and backtrace, so that errors of the same category
    /// produce the same hash and can be grouped across occurrences.
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                std::mem::discriminant(&self.repr).hash(state);
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                std::mem::discriminant(&self.repr).hash(state);
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f, 1)?;
                write_backtrace(payload.backtrace.as_ref(), f, 1)?;

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                } else {
                    for (index, error) in errors.iter().enumerate() {
                        let rendered = format!("{error}");
                        let mut lines = rendered.lines();
                        if let Some(first_line) = lines.next() {
                            write!(f, "\n  {}. {}", index + 1, first_line)?;
                        } else {
                            write!(f, "\n  {}.", index + 1)?;
                        }

                        for line in lines {
                            if line.is_empty() {
                                write!(f, "\n     ")?;
                            } else {
                                write!(f, "\n     {line}")?;
                            }
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            // For aggregated errors, we forward the first contained error as the source.
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes the captured backtrace with indentation.
fn write_backtrace(
    backtrace: &Backtrace,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
) -> fmt::Result {
    let indent_str = "  ".repeat(indent);

    let rendered_backtrace = format!("{backtrace}");
    if !rendered_backtrace.trim().is_empty() {
        write!(f, "\n{indent_str}Backtrace:")?;
        for line in rendered_backtrace.lines() {
            if line.trim().is_empty() {
                write!(f, "\n{indent_str}  ")?;
            } else {
                write!(f, "\n{indent_str}  {line}")?;
            }
        }
    }

    Ok(())
}

/// Writes the detail block with indentation.
fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    if let Some(detail) = detail {
        let indent_str = "  ".repeat(indent);
        if detail.trim().is_empty() {
            write!(f, "\n{indent_str}Detail: <empty>")?;
        } else {
            write!(f, "\n{indent_str}Detail:")?;
            for line in detail.lines() {
                if line.trim().is_empty() {
                    write!(f, "\n{indent_str}  ")?;
                } else {
                    write!(f, "\n{indent_str}  {line}")?;
                }
            }
        }
    }

    Ok(())
}

/// Creates an [`IngestError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for IngestError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> IngestError {
        IngestError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates an [`IngestError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for IngestError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> IngestError {
        IngestError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Creates an [`IngestError`] from a vector of errors for aggregation.
///
/// If the vector contains exactly one error, returns that error directly without
/// wrapping it in the aggregated variant.
impl<E> From<Vec<E>> for IngestError
where
    E: Into<IngestError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> IngestError {
        let location = Location::caller();

        let mut errors: Vec<IngestError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            return errors.pop().expect("just checked length is 1");
        }

        IngestError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts [`std::io::Error`] to [`IngestError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for IngestError {
    #[track_caller]
    fn from(err: std::io::Error) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`serde_json::Error`] to [`IngestError`] with the appropriate error kind.
impl From<serde_json::Error> for IngestError {
    #[track_caller]
    fn from(err: serde_json::Error) -> IngestError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`std::str::Utf8Error`] to [`IngestError`] with [`ErrorKind::ConversionError`].
impl From<std::str::Utf8Error> for IngestError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("UTF-8 conversion failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`std::string::FromUtf8Error`] to [`IngestError`] with [`ErrorKind::ConversionError`].
impl From<std::string::FromUtf8Error> for IngestError {
    #[track_caller]
    fn from(err: std::string::FromUtf8Error) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("UTF-8 string conversion failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`std::num::ParseIntError`] to [`IngestError`] with [`ErrorKind::ConversionError`].
impl From<std::num::ParseIntError> for IngestError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Integer parsing failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`csv::Error`] to [`IngestError`] with the appropriate error kind.
impl From<csv::Error> for IngestError {
    #[track_caller]
    fn from(err: csv::Error) -> IngestError {
        let (kind, description) = if err.is_io_error() {
            (ErrorKind::IoError, "CSV I/O operation failed")
        } else {
            (ErrorKind::SerializationError, "CSV serialization failed")
        };

        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`chrono::ParseError`] to [`IngestError`] with [`ErrorKind::ConversionError`].
impl From<chrono::ParseError> for IngestError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Datetime parsing failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`ingest_config::LoadConfigError`] to [`IngestError`] with [`ErrorKind::ConfigError`].
impl From<ingest_config::LoadConfigError> for IngestError {
    #[track_caller]
    fn from(err: ingest_config::LoadConfigError) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration loading failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`ingest_config::shared::ValidationError`] to [`IngestError`] with
/// [`ErrorKind::ConfigError`].
impl From<ingest_config::shared::ValidationError> for IngestError {
    #[track_caller]
    fn from(err: ingest_config::shared::ValidationError) -> IngestError {
        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration validation failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`sqlx::Error`] to [`IngestError`] with the appropriate error kind.
///
/// Connection and pool failures map to kinds the retry layer treats as transient;
/// serialization failures and deadlocks map to [`ErrorKind::SerializationConflict`];
/// everything else is a query failure.
impl From<sqlx::Error> for IngestError {
    #[track_caller]
    fn from(err: sqlx::Error) -> IngestError {
        let (kind, description) = match &err {
            sqlx::Error::Io(_) => (ErrorKind::StorageConnectionFailed, "Database I/O failed"),
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => (
                ErrorKind::StorageConnectionFailed,
                "Database connection unavailable",
            ),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => (
                    ErrorKind::SerializationConflict,
                    "Database serialization conflict",
                ),
                Some("53100") => (ErrorKind::StorageFull, "Database storage exhausted"),
                Some("08000") | Some("08003") | Some("08006") | Some("53300") | Some("57P03") => (
                    ErrorKind::StorageConnectionFailed,
                    "Database connection failed",
                ),
                _ => (ErrorKind::StorageQueryFailed, "Database query failed"),
            },
            _ => (ErrorKind::StorageQueryFailed, "Database operation failed"),
        };

        let detail = err.to_string();
        let source = Arc::new(err);
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}
