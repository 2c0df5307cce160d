use thiserror::Error;

/// Convenience alias for `Result<T, HeronError>`.
pub type HeronResult<T> = Result<T, HeronError>;

/// Error classification used by the dispatcher and by logging.
///
/// - `Parse`: malformed SQL, raised before any statement object exists
/// - `Semantic`: unknown object, type mismatch; the statement is never cached
/// - `Data`: raised while iterating a cursor (constraint, overflow, bad input)
/// - `Protocol`: unexpected or malformed wire traffic
/// - `Transaction`: statement rejected by the transaction contract
/// - `Canceled`: an expected condition, never logged as an internal failure
/// - `Internal`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Semantic,
    Data,
    Protocol,
    Transaction,
    Canceled,
    Internal,
}

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum HeronError {
    #[error("syntax error: {0}")]
    Parse(String),

    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Execution(#[from] ExecutionError),

    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Txn(#[from] TxnError),

    #[error("canceling statement due to user request")]
    Canceled,

    #[error("terminating connection due to administrator command")]
    AdminTerminated,

    #[error("sorry, too many clients already")]
    TooManyConnections,

    /// A statement compiled against one schema generation was used after the
    /// schema moved on.
    #[error("cached statement is stale: compiled at schema generation {compiled}, current is {current}")]
    StaleStatement { compiled: u64, current: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    /// Cleanup (cursor close) failed after an earlier failure. The cleanup
    /// error is what propagates; the original is kept for diagnostics.
    #[error("{error}")]
    Cleanup {
        error: Box<HeronError>,
        original: Box<HeronError>,
    },
}

/// Semantic / compile-phase errors.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("relation \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("column \"{0}\" does not exist")]
    UnknownColumn(String),

    #[error("routine \"{0}\" does not exist")]
    UnknownRoutine(String),

    #[error("prepared statement \"{0}\" does not exist")]
    UnknownPreparedStatement(String),

    #[error("prepared statement \"{0}\" already exists")]
    DuplicatePreparedStatement(String),

    #[error("cursor \"{0}\" does not exist")]
    UnknownCursor(String),

    #[error("cursor \"{0}\" already exists")]
    DuplicateCursor(String),

    #[error("portal \"{0}\" does not exist")]
    UnknownPortal(String),

    #[error("session {0} does not exist")]
    UnknownSession(i32),

    #[error("unrecognized configuration parameter \"{0}\"")]
    UnknownParameter(String),

    #[error("invalid value for parameter \"{name}\": \"{value}\"")]
    InvalidParameterValue { name: String, value: String },

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("statement supplies {got} parameters, but prepared statement requires {expected}")]
    WrongParameterCount { expected: usize, got: usize },

    #[error("feature not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Semantic(String),
}

/// Errors raised while a cursor is being iterated.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("value out of range: {0}")]
    NumericOverflow(String),

    #[error("duplicate key value violates unique constraint: {0}")]
    UniqueViolation(String),

    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("invalid input syntax: {0}")]
    InvalidTextRepresentation(String),

    #[error("incorrect binary data format: {0}")]
    InvalidBinaryRepresentation(String),

    #[error("invalid COPY data: {0}")]
    BadCopyFormat(String),

    #[error("permission denied: {0}")]
    InsufficientPrivilege(String),

    #[error("{0}")]
    Data(String),
}

/// Wire-level errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message '{code}' of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { code: char, size: usize, max: usize },

    #[error("unexpected message '{0}'")]
    UnexpectedMessage(char),

    #[error("COPY from stdin failed: {0}")]
    CopyFailed(String),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Rejections issued by the transaction contract.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    #[error("cannot execute {0} in a read-only transaction")]
    ReadOnlyTransaction(String),

    #[error("{0} can only be used in transaction blocks")]
    NoActiveTransaction(String),

    #[error("{0} cannot run inside a transaction block")]
    ActiveTransaction(String),

    #[error("could not serialize access: {0}")]
    Serialization(String),
}

impl HeronError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeronError::Parse(_) => ErrorKind::Parse,
            HeronError::Compile(_) | HeronError::StaleStatement { .. } => ErrorKind::Semantic,
            HeronError::Execution(_) => ErrorKind::Data,
            HeronError::Protocol(ProtocolError::CopyFailed(_)) => ErrorKind::Canceled,
            HeronError::Protocol(_) => ErrorKind::Protocol,
            HeronError::Txn(_) => ErrorKind::Transaction,
            HeronError::Canceled | HeronError::AdminTerminated => ErrorKind::Canceled,
            HeronError::TooManyConnections => ErrorKind::Protocol,
            HeronError::Io(_) => ErrorKind::Protocol,
            HeronError::Internal(_) => ErrorKind::Internal,
            HeronError::Cleanup { error, .. } => error.kind(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Canceled)
    }

    /// Map to a PostgreSQL SQLSTATE code.
    pub fn pg_sqlstate(&self) -> &'static str {
        match self {
            HeronError::Parse(_) => "42601", // syntax_error
            HeronError::Compile(e) => match e {
                CompileError::UnknownTable(_) => "42P01",
                CompileError::UnknownColumn(_) => "42703",
                CompileError::UnknownRoutine(_) => "42883",
                CompileError::UnknownPreparedStatement(_) => "26000",
                CompileError::DuplicatePreparedStatement(_) => "42P05",
                CompileError::UnknownCursor(_) => "34000",
                CompileError::DuplicateCursor(_) => "42P03",
                CompileError::UnknownPortal(_) => "34000",
                CompileError::UnknownSession(_) => "42704",
                CompileError::UnknownParameter(_) => "42704",
                CompileError::InvalidParameterValue { .. } => "22023",
                CompileError::TypeMismatch { .. } => "42804",
                CompileError::WrongParameterCount { .. } => "08P01",
                CompileError::Unsupported(_) => "0A000",
                CompileError::Semantic(_) => "42000",
            },
            HeronError::Execution(e) => match e {
                ExecutionError::DivisionByZero => "22012",
                ExecutionError::NumericOverflow(_) => "22003",
                ExecutionError::UniqueViolation(_) => "23505",
                ExecutionError::ConstraintViolation(_) => "23000",
                ExecutionError::InvalidTextRepresentation(_) => "22P02",
                ExecutionError::InvalidBinaryRepresentation(_) => "22P03",
                ExecutionError::BadCopyFormat(_) => "22P04",
                ExecutionError::InsufficientPrivilege(_) => "42501",
                ExecutionError::Data(_) => "22000",
            },
            HeronError::Protocol(ProtocolError::CopyFailed(_)) => "57014", // query_canceled
            HeronError::Protocol(ProtocolError::ConnectionClosed) => "08006",
            HeronError::Protocol(_) => "08P01", // protocol_violation
            HeronError::Txn(e) => match e {
                TxnError::InFailedTransaction => "25P02",
                TxnError::ReadOnlyTransaction(_) => "25006",
                TxnError::NoActiveTransaction(_) => "25P01",
                TxnError::ActiveTransaction(_) => "25001",
                TxnError::Serialization(_) => "40001",
            },
            HeronError::Canceled => "57014",
            HeronError::AdminTerminated => "57P01",
            HeronError::TooManyConnections => "53300",
            HeronError::StaleStatement { .. } => "0A50A",
            HeronError::Io(_) => "58030", // io_error
            HeronError::Internal(_) => "XX000",
            HeronError::Cleanup { error, .. } => error.pg_sqlstate(),
        }
    }

    /// Map to a PostgreSQL severity string.
    pub fn pg_severity(&self) -> &'static str {
        match self {
            HeronError::AdminTerminated | HeronError::TooManyConnections => "FATAL",
            HeronError::Protocol(ProtocolError::MessageTooLarge { .. }) => "FATAL",
            HeronError::Cleanup { error, .. } => error.pg_severity(),
            _ => "ERROR",
        }
    }

    /// Secondary diagnostic text for the ErrorResponse `D` field.
    pub fn pg_detail(&self) -> Option<String> {
        match self {
            HeronError::Cleanup { original, .. } => {
                Some(format!("cleanup failed after earlier error: {original}"))
            }
            _ => None,
        }
    }

    /// Combine a cleanup failure with the error that triggered the cleanup.
    /// The cleanup failure propagates; `original` survives as detail.
    pub fn with_original(self, original: HeronError) -> HeronError {
        HeronError::Cleanup {
            error: Box::new(self),
            original: Box::new(original),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HeronError::Internal(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        HeronError::Compile(CompileError::Unsupported(msg.into()))
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        HeronError::Protocol(ProtocolError::InvalidMessage(msg.into()))
    }
}

/// Run `cleanup` after `result`, keeping both errors when both fail.
pub fn finish_with_cleanup<T>(
    result: HeronResult<T>,
    cleanup: impl FnOnce() -> HeronResult<()>,
) -> HeronResult<T> {
    match (result, cleanup()) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(original), Err(e)) => Err(e.with_original(original)),
    }
}
