//! Database value and error types shared by every workload

use thiserror::Error;

/// Classified database failure kinds
///
/// Classification is driven by SQLSTATE codes so callers never match on
/// server message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Connection could not be established or was lost (SQLSTATE class 08, I/O)
    Connection,
    /// Server refused the connection because all slots are taken (53300)
    TooManyConnections,
    /// Victim of the server's deadlock detector (40P01)
    Deadlock,
    /// Serialization failure (40001)
    SerializationFailure,
    /// Statement canceled by `pg_cancel_backend` or a timeout (57014)
    QueryCanceled,
    /// Session terminated by `pg_terminate_backend` or shutdown (57P01..57P03)
    AdminShutdown,
    /// Object already exists, or a concurrent create lost the race (42P07, 42710, 23505)
    DuplicateObject,
    /// Any other server-reported error
    Query,
    /// Client-side failure (decoding, configuration)
    Other,
}

impl DbErrorKind {
    /// Map a SQLSTATE code to a kind
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "40P01" => Self::Deadlock,
            "40001" => Self::SerializationFailure,
            "57014" => Self::QueryCanceled,
            "57P01" | "57P02" | "57P03" => Self::AdminShutdown,
            "53300" => Self::TooManyConnections,
            "42P07" | "42710" | "23505" => Self::DuplicateObject,
            c if c.starts_with("08") => Self::Connection,
            _ => Self::Query,
        }
    }

    /// Deadlock victims and serialization failures
    pub fn is_lock_conflict(self) -> bool {
        matches!(self, Self::Deadlock | Self::SerializationFailure)
    }

    /// The session itself was signalled (canceled or terminated)
    pub fn is_session_signal(self) -> bool {
        matches!(self, Self::QueryCanceled | Self::AdminShutdown)
    }
}

/// Error returned by the database client
#[derive(Debug, Clone, Error)]
#[error("{message}{}", .code.as_deref().map(|c| format!(" (SQLSTATE {c})")).unwrap_or_default())]
pub struct DbError {
    kind: DbErrorKind,
    code: Option<String>,
    message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Build an error from a server-reported SQLSTATE
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            kind: DbErrorKind::from_sqlstate(&code),
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DbErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// Statement argument
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Int(i64),
    Text(String),
}

impl From<i64> for SqlArg {
    fn from(v: i64) -> Self {
        SqlArg::Int(v)
    }
}

impl From<&str> for SqlArg {
    fn from(v: &str) -> Self {
        SqlArg::Text(v.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(v: String) -> Self {
        SqlArg::Text(v)
    }
}

/// Result row with every column decoded as text
///
/// Queries issued by the engine cast their output columns to `text`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Vec<Option<String>>) -> Self {
        Self { columns }
    }

    /// Convenience constructor for rows without NULLs
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: values.into_iter().map(|v| Some(v.into())).collect(),
        }
    }

    /// Column value, `None` when out of range or NULL
    pub fn get(&self, index: usize) -> Option<&str> {
        self.columns.get(index).and_then(|c| c.as_deref())
    }
}
