//! Error types shared by every Dolphin driver.
//!
//! Every failure carries a stable [`ErrorClass`] so callers can tell
//! conditions they may retry apart from ones that are permanently fatal.

use std::fmt;

/// The primary error type for all Dolphin operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authentication, link loss, failover)
    Connection(ConnectionError),
    /// Error reported by the server for a well-formed command
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Prepared statement lifecycle errors
    Statement(StatementError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors that were not attributed to a live connection
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// Stable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed packet; the connection is unusable.
    ProtocolFraming,
    /// Bad credentials or plugin mismatch.
    AuthenticationRejected,
    /// Well-formed error packet from the server; the connection stays usable.
    ServerError,
    /// I/O failure or a server error indicating the link is gone.
    ConnectionLost,
    /// Prepared statement handle is no longer valid.
    StatementStale,
    /// Transaction replay log exceeded its capacity.
    ReplayOverflow,
    /// No host accepted a connection within the retry budget.
    FailoverExhausted,
    /// Caller mistake: bad arguments, invalid names, bad configuration.
    Usage,
    /// Operation timed out.
    Timeout,
    /// Operation was cancelled.
    Cancelled,
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
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
    /// Every configured host failed within the retry budget
    FailoverExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    /// Vendor error code (e.g. 1062 for a duplicate key)
    pub code: Option<u16>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Cancelled
    Cancelled,
    /// Command form not supported by the server
    Unsupported,
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
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Savepoint not found or invalid
    SavepointNotFound,
    /// Replay log exceeded its capacity; the transaction is lost
    ReplayOverflow,
    /// Replaying the log on the new connection failed
    ReplayFailed,
    /// Connection was re-established but the open transaction was lost
    Lost,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct StatementError {
    pub kind: StatementErrorKind,
    pub sql: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementErrorKind {
    /// Handle was closed or belongs to a connection that no longer exists
    Stale,
    /// Wrong number of bound parameters
    ParameterCount,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Stable classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Connection(c) => match c.kind {
                ConnectionErrorKind::Authentication => ErrorClass::AuthenticationRejected,
                ConnectionErrorKind::FailoverExhausted => ErrorClass::FailoverExhausted,
                _ => ErrorClass::ConnectionLost,
            },
            Error::Query(_) => ErrorClass::ServerError,
            Error::Protocol(_) => ErrorClass::ProtocolFraming,
            Error::Statement(s) => match s.kind {
                StatementErrorKind::Stale => ErrorClass::StatementStale,
                StatementErrorKind::ParameterCount => ErrorClass::Usage,
            },
            Error::Transaction(t) => match t.kind {
                TransactionErrorKind::ReplayOverflow => ErrorClass::ReplayOverflow,
                TransactionErrorKind::ReplayFailed | TransactionErrorKind::Lost => {
                    ErrorClass::ConnectionLost
                }
                TransactionErrorKind::SavepointNotFound => ErrorClass::Usage,
            },
            Error::Io(_) => ErrorClass::ConnectionLost,
            Error::Type(_) | Error::Config(_) | Error::Custom(_) => ErrorClass::Usage,
            Error::Timeout => ErrorClass::Timeout,
            Error::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Is this a retryable error (deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Did the physical link fail? Such errors leave the connection unusable.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Disconnected),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Vendor error code if available.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Statement(s) => Some(&s.sql),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == Some(1062)
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, Some(1451 | 1452))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Statement(e) => write!(f, "Statement error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
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
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConnectionError {}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.sqlstate) {
            (Some(code), Some(state)) => write!(f, "{} ({}, SQLSTATE {})", self.message, code, state),
            (Some(code), None) => write!(f, "{} ({})", self.message, code),
            (None, Some(state)) => write!(f, "{} (SQLSTATE {})", self.message, state),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for QueryError {}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
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

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<StatementError> for Error {
    fn from(err: StatementError) -> Self {
        Error::Statement(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for Dolphin operations.
pub type Result<T> = std::result::Result<T, Error>;
