//! Error types and result definitions for sync operations.
//!
//! [`SyncError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail and source, the caller location and a backtrace. Several errors can be
//! aggregated into one, which is how the failures of concurrent table workers surface.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the engine.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Errors of multiple workers.
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Classification of errors, used to decide how a failure is handled.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection errors
    SourceConnectionFailed,
    TargetConnectionFailed,
    StateStoreConnectionFailed,

    // Query errors
    SourceQueryFailed,
    TargetQueryFailed,
    StateStoreQueryFailed,

    // Schema errors
    MissingTable,
    SchemaConflict,

    // Row level conflicts and write failures
    DataConflict,
    ConstraintViolation,
    RetryExhausted,

    // Resolution errors
    AlreadyResolved,
    AmbiguousResolution,
    MissingManualValue,

    // Rollback errors
    RetentionExpired,
    RollbackDisabled,

    // Lookup errors
    JobNotFound,
    ConflictNotFound,
    TableNotInJob,

    // Data errors
    InvalidData,
    ConversionError,

    // Configuration errors
    ConfigError,

    // IO and serialization errors
    IoError,
    SerializationError,
    DeserializationError,

    // State errors
    InvalidState,
    TableSyncWorkerPanic,
    JobRunPanic,

    Unknown,
}

impl ErrorKind {
    /// Returns `true` for kinds signalling that a database could not be reached.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::TargetConnectionFailed
                | ErrorKind::StateStoreConnectionFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SyncError {
    /// Returns the [`ErrorKind`] of this error, the first one for aggregated errors.
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
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of the error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("Multiple errors"),
        }
    }

    /// Returns the dynamic detail, the first available one for aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Single line rendering without location and backtrace, used for persisted records.
    pub fn summary(&self) -> String {
        match self.detail() {
            Some(detail) => format!("{}: {}", self.description(), detail),
            None => self.description().to_string(),
        }
    }

    /// Attaches an originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for SyncError {
    /// Hashes only the kind and static description so repeated failures group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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

                write_indented(f, "Detail", payload.detail.as_deref())?;

                if payload.backtrace.status() == BacktraceStatus::Captured {
                    write_indented(f, "Backtrace", Some(&payload.backtrace.to_string()))?;
                }

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

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, label: &str, text: Option<&str>) -> fmt::Result {
    let Some(text) = text else {
        return Ok(());
    };

    write!(f, "\n  {label}:")?;
    for line in text.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();
        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
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
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<uuid::Error> for SyncError {
    #[track_caller]
    fn from(err: uuid::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("UUID parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<chrono::ParseError> for SyncError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Timestamp parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`sqlx::Error`] raised by the state store.
///
/// Connectors classify their own errors by side, see
/// [`map_sqlx_error`](crate::connector::postgres::map_sqlx_error).
impl From<sqlx::Error> for SyncError {
    #[track_caller]
    fn from(err: sqlx::Error) -> SyncError {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut => ErrorKind::StateStoreConnectionFailed,
            _ => ErrorKind::StateStoreQueryFailed,
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed("State store operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::StateStoreQueryFailed,
            Cow::Borrowed("State store migration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<config::shared::ValidationError> for SyncError {
    #[track_caller]
    fn from(err: config::shared::ValidationError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid sync configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, sync_error};

    #[test]
    fn single_error_keeps_kind_and_detail() {
        let err = sync_error!(ErrorKind::JobNotFound, "Job not found", "job 42");

        assert_eq!(err.kind(), ErrorKind::JobNotFound);
        assert_eq!(err.detail(), Some("job 42"));
        assert_eq!(err.summary(), "Job not found: job 42");
        assert!(err.to_string().starts_with("[JobNotFound] Job not found @"));
    }

    #[test]
    fn aggregated_errors_report_all_kinds() {
        let err = SyncError::from(vec![
            SyncError::from((ErrorKind::SourceConnectionFailed, "source down")),
            SyncError::from((ErrorKind::MissingTable, "no table")),
        ]);

        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceConnectionFailed, ErrorKind::MissingTable]
        );
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn single_element_aggregation_is_unwrapped() {
        let err = SyncError::from(vec![SyncError::from((ErrorKind::InvalidState, "bad"))]);

        assert_eq!(err.kinds(), vec![ErrorKind::InvalidState]);
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn bail_returns_early() {
        fn check(value: u32) -> SyncResult<u32> {
            if value == 0 {
                bail!(ErrorKind::InvalidData, "Value must not be zero");
            }
            Ok(value)
        }

        assert_eq!(check(3), Ok(3));
        assert_eq!(check(0).unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn validation_errors_become_config_errors() {
        let err = SyncError::from(config::shared::ValidationError::MissingModifiedColumn);

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.detail().unwrap().contains("modified_column"));
    }
}
