//! Error classification: maps driver/transport errors onto the internal taxonomy.
//!
//! The classifier is pure — it never performs I/O and holds no state beyond the
//! match arms below.

use std::fmt;

/// The operation that produced an error, attached to every classified error so
/// that callers (and logs) know where in the request lifecycle a failure hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Ping,
    Prepare,
    Exec,
    Query,
    Begin,
    Commit,
    Rollback,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Ping => "ping",
            Operation::Prepare => "prepare",
            Operation::Exec => "exec",
            Operation::Query => "query",
            Operation::Begin => "begin",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The internal error taxonomy. A classification is a pure function of the
/// raw error and the operation that produced it — classifying the same input
/// twice always yields the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retriable but not one of the more specific transient categories below
    /// (e.g. "too many connections", a generic lock-wait timeout).
    Transient,
    /// Lock-wait / deadlock victim, retriable only inside a transaction.
    Deadlock,
    /// Server or replica refused a write (read-only primary, failover window).
    ReadOnly,
    /// Duplicate key, foreign-key, check, or not-null violation. Never retried.
    ConstraintViolation,
    /// Parse error, privilege error, unknown column/table. Never retried.
    SyntaxError,
    /// Transport-level loss: EOF, reset, broken pipe, DNS failure.
    ConnectionLost,
    /// The calling scope cancelled the operation. Never retried.
    Cancelled,
    /// The calling scope's deadline elapsed. Never retried.
    Timeout,
    /// Anything that doesn't fit the above.
    Fatal,
}

impl ErrorClass {
    /// Whether the retry policy should be consulted at all for this class.
    /// This is a convenience derived from the class, not an independent fact.
    pub fn retriable(self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::Deadlock | ErrorClass::ReadOnly | ErrorClass::ConnectionLost
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Deadlock => "deadlock",
            ErrorClass::ReadOnly => "read_only",
            ErrorClass::ConstraintViolation => "constraint_violation",
            ErrorClass::SyntaxError => "syntax_error",
            ErrorClass::ConnectionLost => "connection_lost",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Boxed error cause, kept type-erased so the classifier doesn't force every
/// caller to depend on `mysql_async`'s error type directly.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type surfaced across the public API. Every variant carries the
/// operation name and, where applicable, the classification and original
/// driver error as its `source()`.
#[derive(Debug, thiserror::Error)]
pub enum DbCoreError {
    #[error("{operation} failed ({class}){}", retry_count.map(|n| format!(", after {n} retries")).unwrap_or_default())]
    Classified {
        class: ErrorClass,
        operation: &'static str,
        retry_count: Option<u32>,
        #[source]
        cause: BoxError,
    },

    /// A commit failed with `ConnectionLost`: the outcome on the server is
    /// unknown. Distinct from a generic `ConnectionLost` so callers cannot
    /// mistake it for a safely-retriable failure.
    #[error("commit outcome is ambiguous: the connection was lost while committing ({operation})")]
    CommitAmbiguous {
        operation: &'static str,
        #[source]
        cause: BoxError,
    },

    #[error("pool is closed")]
    PoolClosed,

    #[error("pool exhausted: no connection became available in time")]
    PoolExhausted,
}

impl DbCoreError {
    pub fn classified(class: ErrorClass, operation: Operation, cause: impl Into<BoxError>) -> Self {
        DbCoreError::Classified {
            class,
            operation: operation.as_str(),
            retry_count: None,
            cause: cause.into(),
        }
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        if let DbCoreError::Classified { retry_count, .. } = &mut self {
            *retry_count = Some(count);
        }
        self
    }

    /// The classification tag, if this is a classified error. `CommitAmbiguous`
    /// reports `ConnectionLost` since that's the underlying cause; pool-level
    /// errors have no classification of their own.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            DbCoreError::Classified { class, .. } => Some(*class),
            DbCoreError::CommitAmbiguous { .. } => Some(ErrorClass::ConnectionLost),
            DbCoreError::PoolClosed | DbCoreError::PoolExhausted => None,
        }
    }
}

/// Classifies a raw `mysql_async` error for the given operation context.
/// Re-classifying the same `(err, op)` pair always yields the same tag.
pub fn classify(err: &mysql_async::Error, op: Operation) -> ErrorClass {
    use mysql_async::Error as E;
    match err {
        E::Io(io_err) => classify_io(io_err),
        E::Driver(_) => ErrorClass::Fatal,
        E::Server(server_err) => classify_server(server_err.code, &server_err.state),
        E::Other(_) => ErrorClass::Fatal,
        E::Url(_) => ErrorClass::Fatal,
        _ => {
            let _ = op;
            ErrorClass::Fatal
        }
    }
}

fn classify_io(io_err: &mysql_async::IoError) -> ErrorClass {
    use std::io::ErrorKind;
    match io_err {
        mysql_async::IoError::Io(e) => match e.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => ErrorClass::ConnectionLost,
            ErrorKind::TimedOut => ErrorClass::Timeout,
            _ => ErrorClass::ConnectionLost,
        },
        mysql_async::IoError::Tls(_) => ErrorClass::ConnectionLost,
    }
}

/// MySQL server error-code / SQLSTATE classification. Codes drawn from
/// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html.
fn classify_server(code: u16, state: &str) -> ErrorClass {
    const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    const ER_LOCK_DEADLOCK: u16 = 1213;
    const ER_DUP_ENTRY: u16 = 1062;
    const ER_NO_REFERENCED_ROW: u16 = 1216;
    const ER_ROW_IS_REFERENCED: u16 = 1217;
    const ER_NO_REFERENCED_ROW_2: u16 = 1452;
    const ER_ROW_IS_REFERENCED_2: u16 = 1451;
    const ER_BAD_NULL_ERROR: u16 = 1048;
    const ER_CHECK_CONSTRAINT_VIOLATED: u16 = 3819;
    const ER_PARSE_ERROR: u16 = 1064;
    const ER_BAD_FIELD_ERROR: u16 = 1054;
    const ER_NO_SUCH_TABLE: u16 = 1146;
    const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
    const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290; // --read-only
    const ER_READ_ONLY_MODE: u16 = 1836; // super-read-only
    const ER_CON_COUNT_ERROR: u16 = 1040;
    const ER_SERVER_SHUTDOWN: u16 = 1053;
    const CR_CONNECTION_ERROR: u16 = 2002;
    const CR_CONN_HOST_ERROR: u16 = 2003;
    const CR_SERVER_GONE_ERROR: u16 = 2006;
    const CR_SERVER_LOST: u16 = 2013;
    const ER_QUERY_INTERRUPTED: u16 = 1317;

    match code {
        ER_LOCK_DEADLOCK => return ErrorClass::Deadlock,
        ER_LOCK_WAIT_TIMEOUT => return ErrorClass::Deadlock,
        ER_OPTION_PREVENTS_STATEMENT | ER_READ_ONLY_MODE => return ErrorClass::ReadOnly,
        ER_DUP_ENTRY
        | ER_NO_REFERENCED_ROW
        | ER_ROW_IS_REFERENCED
        | ER_NO_REFERENCED_ROW_2
        | ER_ROW_IS_REFERENCED_2
        | ER_BAD_NULL_ERROR
        | ER_CHECK_CONSTRAINT_VIOLATED => return ErrorClass::ConstraintViolation,
        ER_PARSE_ERROR | ER_BAD_FIELD_ERROR | ER_NO_SUCH_TABLE | ER_ACCESS_DENIED_ERROR | ER_DBACCESS_DENIED_ERROR => {
            return ErrorClass::SyntaxError
        }
        ER_QUERY_INTERRUPTED => return ErrorClass::Cancelled,
        CR_CONNECTION_ERROR | CR_CONN_HOST_ERROR | CR_SERVER_GONE_ERROR | CR_SERVER_LOST => {
            return ErrorClass::ConnectionLost
        }
        ER_CON_COUNT_ERROR | ER_SERVER_SHUTDOWN => return ErrorClass::Transient,
        _ => {}
    }

    match state {
        "40001" => ErrorClass::Deadlock,
        "08S01" | "08003" | "08006" | "08004" => ErrorClass::ConnectionLost,
        "70100" => ErrorClass::Cancelled,
        "HYT00" | "HYT01" => ErrorClass::Timeout,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_err(code: u16, state: &str) -> mysql_async::Error {
        mysql_async::Error::Server(mysql_async::ServerError {
            code,
            message: "simulated".into(),
            state: state.into(),
        })
    }

    #[test]
    fn deadlock_is_retriable() {
        let err = server_err(1213, "40001");
        assert_eq!(classify(&err, Operation::Exec), ErrorClass::Deadlock);
        assert!(ErrorClass::Deadlock.retriable());
    }

    #[test]
    fn constraint_violation_is_not_retriable() {
        let err = server_err(1062, "23000");
        assert_eq!(classify(&err, Operation::Exec), ErrorClass::ConstraintViolation);
        assert!(!ErrorClass::ConstraintViolation.retriable());
    }

    #[test]
    fn classification_is_idempotent() {
        let err = server_err(2013, "HY000");
        let a = classify(&err, Operation::Query);
        let b = classify(&err, Operation::Query);
        assert_eq!(a, b);
        assert_eq!(a, ErrorClass::ConnectionLost);
    }

    #[test]
    fn read_only_failover_is_retriable() {
        let err = server_err(1836, "HY000");
        assert_eq!(classify(&err, Operation::Exec), ErrorClass::ReadOnly);
        assert!(ErrorClass::ReadOnly.retriable());
    }

    #[test]
    fn syntax_error_never_retried() {
        let err = server_err(1064, "42000");
        assert_eq!(classify(&err, Operation::Query), ErrorClass::SyntaxError);
        assert!(!ErrorClass::SyntaxError.retriable());
    }
}
