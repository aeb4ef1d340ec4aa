//! Structured error types for dbaccess-core.
//!
//! Every failure propagates to the immediate caller. Driver errors
//! (constraint violations included) are carried untranslated in
//! [`DbError::Driver`]; the helpers below only expose their native codes.

use thiserror::Error;

/// Main error type for database-access operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Opening or reopening the connection failed
    #[error("open connection failed: {source}")]
    Connection {
        #[source]
        source: sqlx::Error,
    },

    /// Statement execution or row decoding failed in the driver
    #[error("database error: {0}")]
    Driver(#[from] sqlx::Error),

    /// No factory registered under the requested model name
    #[error("unknown model '{model}'")]
    UnknownModel { model: String },

    /// A factory is already registered under this model name
    #[error("model '{model}' is already registered")]
    DuplicateModel { model: String },

    /// A registered factory failed to build a record from the current row
    #[error("failed to materialize '{model}': {source}")]
    Materialization {
        model: String,
        #[source]
        source: sqlx::Error,
    },

    /// Operation is declared but not implemented by this layer
    #[error("operation not supported: {operation}")]
    Unsupported { operation: &'static str },

    /// The same name appears in both the value and the where parameters
    #[error("parameter ':{name}' is bound twice")]
    ParameterCollision { name: String },

    /// The statement references a marker no parameter supplies
    #[error("statement references ':{name}' but no such parameter was given")]
    MissingParameter { name: String },

    /// A parameter was given that the statement never references
    #[error("parameter ':{name}' is not referenced by the statement")]
    UnusedParameter { name: String },

    /// Parameter names double as placeholders and must be identifiers
    #[error("invalid parameter name '{name}'")]
    InvalidParameterName { name: String },

    /// Table or column name is not a plain (optionally qualified) identifier
    #[error("invalid identifier '{name}'")]
    InvalidIdentifier { name: String },

    /// A statement builder was handed an empty parameter map
    #[error("{operation} requires at least one parameter")]
    EmptyParameters { operation: &'static str },

    /// Caller-supplied argument is unusable
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A bulk column's array length differs from the declared row count
    #[error("bulk column '{column}' has {actual} values, expected {expected}")]
    BulkLengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// A bulk value does not fit the column's declared type
    #[error("bulk column '{column}' is {expected} but got {found}")]
    BulkTypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Result column type has no `Value` mapping
    #[error("column '{column}' has unsupported type {type_name}")]
    UnsupportedColumnType { column: String, type_name: String },

    /// A composite-key column was NULL
    #[error("key column '{column}' is NULL")]
    NullKeyColumn { column: String },

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

/// Result type alias for dbaccess-core operations
pub type Result<T> = std::result::Result<T, DbError>;

/// SQLSTATE for `unique_violation`
const UNIQUE_VIOLATION: &str = "23505";

impl DbError {
    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Native SQLSTATE of a server-side error, if this is one.
    pub fn database_code(&self) -> Option<String> {
        match self {
            Self::Driver(err) => err
                .as_database_error()
                .and_then(|db| db.code())
                .map(|code| code.into_owned()),
            _ => None,
        }
    }

    /// Whether the server rejected the statement with a unique violation.
    pub fn is_unique_violation(&self) -> bool {
        self.database_code().as_deref() == Some(UNIQUE_VIOLATION)
    }
}

/// Whether a driver error means the transport itself is gone.
///
/// Server-side errors leave the connection usable; these do not.
pub(crate) fn is_transport_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
