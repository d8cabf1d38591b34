use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy visible at the crate boundary.
///
/// Variants follow the classification in the component design: engine
/// failures are reclassified by extended result code rather than exposed
/// as a single opaque backend error, so callers can match on
/// `Error::ConstraintViolation` etc. without reaching into `rusqlite`.
#[derive(Debug)]
pub enum Error {
    /// Any operation attempted on an unopened or already-closed connection.
    InvalidConnection,
    /// The engine returned a non-OK status not covered by a more specific
    /// variant below.
    SQLiteError(rusqlite::Error),
    /// A `UNIQUE`/`CHECK`/`FOREIGN KEY`/`NOT NULL` constraint was violated.
    ConstraintViolation(rusqlite::Error),
    /// The database file is locked by another connection.
    Busy(rusqlite::Error),
    /// A write was attempted against a read-only database.
    ReadOnly(rusqlite::Error),
    /// Statement text contained more than one SQL statement.
    TooManyStatements,
    /// A column was extracted as a type incompatible with its stored type.
    ValueTypeError,
    /// A column index was negative or greater than or equal to the column
    /// count of the current row.
    ResultIndexOutOfRange,
    /// A value was extracted before a successful `step` returned a row.
    NoResultRow,
    /// `step_final` encountered a result row where none was expected.
    UnexpectedResultRow,
    /// A null or otherwise unbound [`crate::Handle`] was dereferenced.
    UnboundHandle,
    /// An `Id`, `CacheKey`, or handle counter was exhausted.
    OverflowError,
    /// `commit`/`cancel` called without a matching `begin`, or `commit`
    /// called on a poisoned transaction.
    TransactionNestingError,
    /// Opening the database file itself failed (permissions, missing
    /// parent directory, and the like), as distinct from a SQL failure
    /// after a successful open.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConnection => write!(f, "connection is not open"),
            Self::SQLiteError(e) => write!(f, "sqlite error: {}", e),
            Self::ConstraintViolation(e) => write!(f, "constraint violation: {}", e),
            Self::Busy(e) => write!(f, "database is busy: {}", e),
            Self::ReadOnly(e) => write!(f, "database is read-only: {}", e),
            Self::TooManyStatements => write!(f, "statement text contains more than one statement"),
            Self::ValueTypeError => write!(f, "column value type is incompatible with the requested type"),
            Self::ResultIndexOutOfRange => write!(f, "result column index out of range"),
            Self::NoResultRow => write!(f, "no current result row"),
            Self::UnexpectedResultRow => write!(f, "unexpected result row"),
            Self::UnboundHandle => write!(f, "dereference of an unbound handle"),
            Self::OverflowError => write!(f, "counter overflow"),
            Self::TransactionNestingError => write!(f, "unbalanced or poisoned transaction"),
            Self::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SQLiteError(e)
            | Self::ConstraintViolation(e)
            | Self::Busy(e)
            | Self::ReadOnly(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as E;
        match &e {
            E::SqliteFailure(ffi_err, _) => match ffi_err.code {
                ErrorCode::ConstraintViolation => Self::ConstraintViolation(e),
                ErrorCode::DatabaseBusy => Self::Busy(e),
                ErrorCode::ReadOnly => Self::ReadOnly(e),
                _ => Self::SQLiteError(e),
            },
            E::InvalidColumnType(..) => Self::ValueTypeError,
            E::InvalidColumnIndex(_) => Self::ResultIndexOutOfRange,
            E::QueryReturnedNoRows => Self::NoResultRow,
            _ => Self::SQLiteError(e),
        }
    }
}
