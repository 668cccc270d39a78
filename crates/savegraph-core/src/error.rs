//! Error types for savegraph operations.

use crate::path::SavePath;
use crate::value::{RowKey, Value};
use std::fmt;

/// The primary error type for all savegraph operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors reported by the executor
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration and catalog errors
    Config(ConfigError),
    /// Save / delete command errors
    Save(SaveError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    /// Create a config error without an underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

/// Kind of statement a failure was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    /// SQL keyword for this statement kind.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        }
    }
}

/// Failures raised by the save and delete commands.
///
/// Every variant carries the [`SavePath`] of the graph position it
/// originated from. None of them are retried internally; the caller's
/// transaction is expected to roll back whatever already executed.
#[derive(Debug)]
pub enum SaveError {
    /// Node has neither a primary key nor its complete business key.
    MissingIdentity {
        path: SavePath,
        entity: &'static str,
        key_props: Vec<&'static str>,
    },
    /// Optimistic-locked entity updated without a version.
    MissingVersion {
        path: SavePath,
        entity: &'static str,
        id: Value,
    },
    /// Versioned UPDATE matched zero rows.
    OptimisticLockViolation {
        path: SavePath,
        entity: &'static str,
        id: Value,
        version: Value,
    },
    /// Orphaned rows found on an association whose dissociate action is NONE.
    DissociationNotAllowed {
        path: SavePath,
        entity: &'static str,
        association: &'static str,
        ids: Vec<Value>,
    },
    /// Id-only references pointing at rows that do not exist.
    IllegalReferenceId {
        path: SavePath,
        association: &'static str,
        target: &'static str,
        ids: Vec<Value>,
    },
    /// The executor failed while running a statement.
    StatementExecutionFailed {
        path: SavePath,
        table: &'static str,
        statement: StatementKind,
        source: Box<Error>,
    },
    /// A business key matched more than one existing row.
    AmbiguousKey {
        path: SavePath,
        entity: &'static str,
        key: RowKey,
    },
    /// Node does not fit the catalog (unknown entity/property, wrong slot shape).
    InvalidNode {
        path: SavePath,
        entity: &'static str,
        message: String,
    },
}

/// Discriminant of [`SaveError`], for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveErrorKind {
    MissingIdentity,
    MissingVersion,
    OptimisticLockViolation,
    DissociationNotAllowed,
    IllegalReferenceId,
    StatementExecutionFailed,
    AmbiguousKey,
    InvalidNode,
}

impl SaveError {
    /// The kind of failure.
    pub fn kind(&self) -> SaveErrorKind {
        match self {
            SaveError::MissingIdentity { .. } => SaveErrorKind::MissingIdentity,
            SaveError::MissingVersion { .. } => SaveErrorKind::MissingVersion,
            SaveError::OptimisticLockViolation { .. } => SaveErrorKind::OptimisticLockViolation,
            SaveError::DissociationNotAllowed { .. } => SaveErrorKind::DissociationNotAllowed,
            SaveError::IllegalReferenceId { .. } => SaveErrorKind::IllegalReferenceId,
            SaveError::StatementExecutionFailed { .. } => SaveErrorKind::StatementExecutionFailed,
            SaveError::AmbiguousKey { .. } => SaveErrorKind::AmbiguousKey,
            SaveError::InvalidNode { .. } => SaveErrorKind::InvalidNode,
        }
    }

    /// Graph position the failure originated from.
    pub fn path(&self) -> &SavePath {
        match self {
            SaveError::MissingIdentity { path, .. }
            | SaveError::MissingVersion { path, .. }
            | SaveError::OptimisticLockViolation { path, .. }
            | SaveError::DissociationNotAllowed { path, .. }
            | SaveError::IllegalReferenceId { path, .. }
            | SaveError::StatementExecutionFailed { path, .. }
            | SaveError::AmbiguousKey { path, .. }
            | SaveError::InvalidNode { path, .. } => path,
        }
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    write!(f, "[")?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{value}")?;
    }
    write!(f, "]")
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::MissingIdentity {
                path,
                entity,
                key_props,
            } => {
                if key_props.is_empty() {
                    write!(f, "{path}: {entity} node has no id")
                } else {
                    write!(
                        f,
                        "{path}: {entity} node has neither id nor key ({})",
                        key_props.join(", ")
                    )
                }
            }
            SaveError::MissingVersion { path, entity, id } => {
                write!(f, "{path}: {entity}({id}) is versioned but no version was given")
            }
            SaveError::OptimisticLockViolation {
                path,
                entity,
                id,
                version,
            } => write!(
                f,
                "{path}: optimistic lock failed for {entity}({id}) at version {version}"
            ),
            SaveError::DissociationNotAllowed {
                path,
                entity,
                association,
                ids,
            } => {
                write!(
                    f,
                    "{path}: cannot dissociate {entity} rows via {entity}.{association}, ids "
                )?;
                write_values(f, ids)
            }
            SaveError::IllegalReferenceId {
                path,
                association,
                target,
                ids,
            } => {
                write!(f, "{path}: {association} references missing {target} ids ")?;
                write_values(f, ids)
            }
            SaveError::StatementExecutionFailed {
                path,
                table,
                statement,
                source,
            } => write!(
                f,
                "{path}: {} on \"{table}\" failed: {source}",
                statement.as_sql()
            ),
            SaveError::AmbiguousKey { path, entity, key } => {
                write!(f, "{path}: key {key} matches more than one {entity} row")
            }
            SaveError::InvalidNode {
                path,
                entity,
                message,
            } => write!(f, "{path}: invalid {entity} node: {message}"),
        }
    }
}

impl std::error::Error for SaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SaveError::StatementExecutionFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, timeouts)?
    ///
    /// The engine never retries; this is for callers deciding whether to
    /// rerun the whole transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Save(SaveError::StatementExecutionFailed { source, .. }) => source.is_retryable(),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Save(SaveError::StatementExecutionFailed { source, .. }) => source.sqlstate(),
            _ => None,
        }
    }

    /// Unique constraint violation, raw or behind a failed statement.
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate() == Some("23505")
    }

    /// Foreign key violation, raw or behind a failed statement.
    ///
    /// This is how a reference to a missing row surfaces when id checking
    /// leaves a real foreign key to the database.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate() == Some("23503")
    }

    /// Whether this is a save command failure.
    pub fn is_save_error(&self) -> bool {
        matches!(self, Error::Save(_))
    }

    /// Borrow the save command failure, if this is one.
    pub fn as_save_error(&self) -> Option<&SaveError> {
        match self {
            Error::Save(e) => Some(e),
            _ => None,
        }
    }

    /// Kind of the save command failure, if this is one.
    pub fn save_error_kind(&self) -> Option<SaveErrorKind> {
        self.as_save_error().map(SaveError::kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Save(e) => write!(f, "Save error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Save(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<SaveError> for Error {
    fn from(err: SaveError) -> Self {
        Error::Save(err)
    }
}

/// Result type alias for savegraph operations.
pub type Result<T> = std::result::Result<T, Error>;
