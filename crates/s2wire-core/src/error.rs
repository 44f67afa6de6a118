//! Error types for s2wire operations.
//!
//! Errors fall into five families that callers handle differently:
//!
//! - transport failures (`Connection`, `Io`, `Timeout`) always tear the
//!   session down;
//! - protocol failures (`Protocol`) tear it down too, and carry an explicit
//!   "must reconnect" flag;
//! - server errors (`Query`) are propagated and leave the session usable;
//! - decode failures (`Decode`) are local to one value;
//! - replay outcomes surface as `Connection` errors of a transient kind so
//!   callers know that retrying the whole transaction is meaningful.

use std::fmt;

/// SQL state reported for transient reconnection outcomes.
pub const TRANSIENT_SQLSTATE: &str = "25S03";

/// The primary error type for all s2wire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, replay outcomes)
    Connection(ConnectionError),
    /// Server-reported errors (ERR packets)
    Query(QueryError),
    /// Per-value decode errors
    Decode(DecodeError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled
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
    /// Every candidate host failed
    AllHostsDown,
    /// Session already closed
    Closed,
    /// Reconnected to a new host; the failed command was not executed
    /// (or its outcome is unknown, e.g. COMMIT).
    TransientReconnected,
    /// Reconnected to a new host; the open transaction could not be replayed.
    TransactionLost,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub code: u16,
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
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Statement interrupted (KILL QUERY / timeout)
    Interrupted,
    /// Other database error
    Database,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    /// Wire type name, e.g. "LONGLONG UNSIGNED"
    pub wire_type: String,
    /// Requested target representation, e.g. "i32"
    pub target: &'static str,
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Value does not fit the target
    Overflow,
    /// Target representation incompatible with the wire type
    TypeMismatch,
    /// Value bytes could not be parsed
    Malformed,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Packet content could not be parsed
    Malformed,
    /// Packet type not valid for the current exchange
    UnexpectedPacket,
    /// Sequence number did not match the expected value
    SequenceMismatch,
    /// Payload exceeds the negotiated max packet size.
    ///
    /// `must_reconnect` is false when nothing was written yet and the
    /// session remains in a consistent state.
    PacketTooLarge { must_reconnect: bool },
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a transport-level connection error.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a protocol error of the given kind.
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            kind,
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Shorthand for a malformed-packet protocol error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::protocol(ProtocolErrorKind::Malformed, message)
    }

    /// Is this a transient outcome where retrying the whole transaction
    /// (or the failed command) on the same coordinator is meaningful?
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::TransientReconnected
                    | ConnectionErrorKind::TransactionLost,
                ..
            })
        )
    }

    /// Does this error leave the session unusable?
    ///
    /// Server errors, decode errors and an oversized packet that was rejected
    /// before any byte was written keep the session alive.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Error::Query(_) | Error::Decode(_) | Error::Config(_) | Error::Custom(_) => false,
            Error::Protocol(p) => match p.kind {
                ProtocolErrorKind::PacketTooLarge { must_reconnect } => must_reconnect,
                _ => true,
            },
            Error::Connection(c) => !matches!(
                c.kind,
                ConnectionErrorKind::TransientReconnected | ConnectionErrorKind::TransactionLost
            ),
            Error::Io(_) | Error::Timeout | Error::Cancelled => true,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Authentication
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Ssl
                    | ConnectionErrorKind::DnsResolution
                    | ConnectionErrorKind::Refused
                    | ConnectionErrorKind::AllHostsDown
            ),
            Error::Io(_) | Error::Timeout => true,
            Error::Protocol(_) => self.requires_reconnect(),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for duplicate key)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Connection(_) if self.is_transient() => Some(TRANSIENT_SQLSTATE),
            _ => None,
        }
    }

    /// Server error code, if this is a server error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Attach the offending SQL text to a server error that lacks it.
    pub fn with_sql(mut self, sql: &str) -> Self {
        if let Error::Query(q) = &mut self {
            if q.sql.is_none() {
                q.sql = Some(sql.to_string());
            }
        }
        self
    }
}

impl QueryError {
    /// Classify a MySQL-family server error code.
    pub fn kind_for_code(code: u16) -> QueryErrorKind {
        match code {
            1062 | 1451 | 1452 | 1048 | 1216 | 1217 => QueryErrorKind::Constraint,
            1064 | 1149 => QueryErrorKind::Syntax,
            1146 | 1054 | 1049 => QueryErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 | 1227 => QueryErrorKind::Permission,
            1213 | 1205 => QueryErrorKind::Deadlock,
            1317 | 3024 => QueryErrorKind::Interrupted,
            _ => QueryErrorKind::Database,
        }
    }

    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }
}

impl DecodeError {
    pub fn new(
        kind: DecodeErrorKind,
        wire_type: impl Into<String>,
        target: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            wire_type: wire_type.into(),
            target,
            column: None,
            message: message.into(),
        }
    }

    /// Name the column the failing value belongs to.
    pub fn in_column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(
                        f,
                        "Server error {} (SQLSTATE {}): {}",
                        e.code, sqlstate, e.message
                    )?;
                } else {
                    write!(f, "Server error {}: {}", e.code, e.message)?;
                }
                if let Some(sql) = &e.sql {
                    write!(f, " [sql: {}]", sql)?;
                }
                Ok(())
            }
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
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
            Error::Decode(e) => Some(e),
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

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, sqlstate)
        } else {
            write!(f, "{} ({})", self.message, self.code)
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DecodeErrorKind::Overflow => "overflow",
            DecodeErrorKind::TypeMismatch => "type mismatch",
            DecodeErrorKind::Malformed => "malformed value",
        };
        if let Some(col) = &self.column {
            write!(
                f,
                "{} decoding {} as {} in column '{}': {}",
                kind, self.wire_type, self.target, col, self.message
            )
        } else {
            write!(
                f,
                "{} decoding {} as {}: {}",
                kind, self.wire_type, self.target, self.message
            )
        }
    }
}

impl std::error::Error for DecodeError {}

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
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(err),
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

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for s2wire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: u16) -> Error {
        Error::Query(QueryError {
            kind: QueryError::kind_for_code(code),
            code,
            sql: None,
            sqlstate: Some("23000".to_string()),
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
            source: None,
        })
    }

    #[test]
    fn server_error_helpers() {
        let err = server_error(1062).with_sql("INSERT INTO t VALUES (1)");
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
        assert!(!err.requires_reconnect());
        assert!(!err.is_transient());
        let shown = err.to_string();
        assert!(shown.contains("1062"));
        assert!(shown.contains("INSERT INTO t"));
    }

    #[test]
    fn with_sql_keeps_existing_text() {
        let err = server_error(1064).with_sql("first").with_sql("second");
        assert_eq!(err.sql(), Some("first"));
    }

    #[test]
    fn transient_errors_are_distinct_from_fatal() {
        let lost = Error::connection(ConnectionErrorKind::TransactionLost, "tx lost");
        assert!(lost.is_transient());
        assert!(!lost.requires_reconnect());
        assert_eq!(lost.sqlstate(), Some(TRANSIENT_SQLSTATE));

        let down = Error::connection(ConnectionErrorKind::AllHostsDown, "no host");
        assert!(!down.is_transient());
        assert!(down.requires_reconnect());
        assert!(down.is_connection_error());
    }

    #[test]
    fn packet_too_large_reconnect_flag() {
        let safe = Error::protocol(
            ProtocolErrorKind::PacketTooLarge {
                must_reconnect: false,
            },
            "too big",
        );
        assert!(!safe.requires_reconnect());
        let fatal = Error::protocol(
            ProtocolErrorKind::PacketTooLarge {
                must_reconnect: true,
            },
            "too big",
        );
        assert!(fatal.requires_reconnect());
        assert!(Error::malformed("bad").requires_reconnect());
    }

    #[test]
    fn decode_errors_are_local() {
        let err: Error = DecodeError::new(
            DecodeErrorKind::Overflow,
            "LONGLONG UNSIGNED",
            "i64",
            "18446744073709551615 out of range",
        )
        .in_column("id")
        .into();
        assert!(!err.requires_reconnect());
        assert!(err.to_string().contains("column 'id'"));
    }

    #[test]
    fn io_timeouts_map_to_timeout() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "t").into();
        assert!(matches!(err, Error::Timeout));
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "b").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
