//! Error types for the transaction core.
//!
//! Driver failures are wrapped in [`DbError::Database`] with a
//! [`DatabaseErrorKind`] that mirrors the DB-API exception hierarchy, so
//! callers can tell data/integrity problems (the connection is still fine)
//! from operational ones (the connection may be broken).

use thiserror::Error;

/// Classification of a driver-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    Operational,
    Integrity,
    Data,
    Programming,
    Interface,
    Internal,
}

impl std::fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Operational => "OperationalError",
            Self::Integrity => "IntegrityError",
            Self::Data => "DataError",
            Self::Programming => "ProgrammingError",
            Self::Interface => "InterfaceError",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Improperly configured: {message}")]
    ImproperlyConfigured { message: String },

    #[error("{kind}: {message}")]
    Database {
        kind: DatabaseErrorKind,
        message: String,
        /// e.g., "40001" for a serialization failure
        sql_state: Option<String>,
    },

    #[error("{message}")]
    TransactionManagement { message: String },

    #[error("A durable atomic block cannot be nested within another atomic block.")]
    NestedDurable,

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    #[error("The connection '{alias}' doesn't exist.")]
    ConnectionDoesNotExist { alias: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Hook '{name}' failed: {message}")]
    Hook { name: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn improperly_configured(message: impl Into<String>) -> Self {
        Self::ImproperlyConfigured {
            message: message.into(),
        }
    }

    /// Create a driver error of the given kind.
    pub fn database(
        kind: DatabaseErrorKind,
        message: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::Database {
            kind,
            message: message.into(),
            sql_state,
        }
    }

    /// Shorthand for an operational driver error without SQL state.
    pub fn operational(message: impl Into<String>) -> Self {
        Self::database(DatabaseErrorKind::Operational, message, None)
    }

    pub fn transaction_management(message: impl Into<String>) -> Self {
        Self::TransactionManagement {
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn connection_does_not_exist(alias: impl Into<String>) -> Self {
        Self::ConnectionDoesNotExist {
            alias: alias.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn hook(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors reported by the driver.
    pub fn is_database_error(&self) -> bool {
        matches!(self, Self::Database { .. })
    }

    /// Whether this error should flag the connection for a usability probe.
    ///
    /// Data and integrity errors leave the connection in a known state; any
    /// other driver error may have broken it.
    pub fn marks_connection_unusable(&self) -> bool {
        match self {
            Self::Database { kind, .. } => {
                !matches!(kind, DatabaseErrorKind::Data | DatabaseErrorKind::Integrity)
            }
            _ => false,
        }
    }

    /// SQLSTATE code, when the driver reported one.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Classify a SQLSTATE by its class prefix.
fn kind_for_sql_state(code: Option<&str>) -> DatabaseErrorKind {
    match code.map(|c| c.get(..2).unwrap_or(c)) {
        Some("23") => DatabaseErrorKind::Integrity,
        Some("22") => DatabaseErrorKind::Data,
        Some("42") => DatabaseErrorKind::Programming,
        Some("08") | Some("53") | Some("57") | Some("40") => DatabaseErrorKind::Operational,
        Some("XX") => DatabaseErrorKind::Internal,
        _ => DatabaseErrorKind::Operational,
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::improperly_configured(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let kind = match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation => DatabaseErrorKind::Integrity,
                    _ => kind_for_sql_state(code.as_deref()),
                };
                DbError::database(kind, db_err.message(), code)
            }
            sqlx::Error::RowNotFound => {
                DbError::database(DatabaseErrorKind::Programming, "No rows returned", None)
            }
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => DbError::operational("Connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::operational(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::operational(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DbError::database(
                DatabaseErrorKind::Interface,
                format!("Protocol error: {}", msg),
                None,
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                DatabaseErrorKind::Programming,
                format!("Column not found: {}", col),
                None,
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::database(
                DatabaseErrorKind::Data,
                format!("Failed to decode column {}: {}", index, source),
                None,
            ),
            sqlx::Error::Decode(source) => DbError::database(
                DatabaseErrorKind::Data,
                format!("Decode error: {}", source),
                None,
            ),
            sqlx::Error::WorkerCrashed => DbError::operational("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection_does_not_exist("other");
        assert_eq!(err.to_string(), "The connection 'other' doesn't exist.");

        let err = DbError::operational("server closed the connection");
        assert_eq!(
            err.to_string(),
            "OperationalError: server closed the connection"
        );
    }

    #[test]
    fn test_nested_durable_message() {
        assert!(DbError::NestedDurable.to_string().contains("durable"));
    }

    #[test]
    fn test_marks_connection_unusable() {
        assert!(DbError::operational("gone").marks_connection_unusable());
        assert!(
            !DbError::database(DatabaseErrorKind::Integrity, "dup", Some("23505".into()))
                .marks_connection_unusable()
        );
        assert!(
            !DbError::database(DatabaseErrorKind::Data, "overflow", None)
                .marks_connection_unusable()
        );
        assert!(!DbError::NestedDurable.marks_connection_unusable());
    }

    #[test]
    fn test_kind_for_sql_state() {
        assert_eq!(kind_for_sql_state(Some("23505")), DatabaseErrorKind::Integrity);
        assert_eq!(kind_for_sql_state(Some("22012")), DatabaseErrorKind::Data);
        assert_eq!(kind_for_sql_state(Some("42P01")), DatabaseErrorKind::Programming);
        assert_eq!(kind_for_sql_state(Some("40001")), DatabaseErrorKind::Operational);
        assert_eq!(kind_for_sql_state(None), DatabaseErrorKind::Operational);
    }

    #[test]
    fn test_sql_state_accessor() {
        let err = DbError::database(DatabaseErrorKind::Programming, "bad", Some("42601".into()));
        assert_eq!(err.sql_state(), Some("42601"));
        assert!(err.is_database_error());
        assert_eq!(DbError::internal("x").sql_state(), None);
    }
}
