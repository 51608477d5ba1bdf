//! Connection-related data models.
//!
//! This module defines the resolved connection parameters handed to drivers
//! and the small enums shared by the connection layer.

use crate::config::DatabaseSettings;
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_NAME_LENGTH: usize = 63;

/// Backends served by the sqlx driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    /// Map a normalized engine name to a backend.
    pub fn from_engine(engine: &str) -> Option<Self> {
        match engine {
            "postgresql" => Some(Self::PostgreSQL),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Which execution model a connection handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionModel {
    /// Driven to completion on the calling thread.
    Blocking,
    /// Awaited cooperatively by async tasks.
    Suspendable,
}

impl std::fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking => write!(f, "blocking"),
            Self::Suspendable => write!(f, "suspendable"),
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Parse a level from settings; accepts `read committed`,
    /// `READ_COMMITTED` and similar spellings.
    pub fn parse(value: &str) -> DbResult<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "read uncommitted" => Ok(Self::ReadUncommitted),
            "read committed" => Ok(Self::ReadCommitted),
            "repeatable read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(DbError::improperly_configured(format!(
                "Invalid transaction isolation level '{value}' specified. Use one of: \
                 read uncommitted, read committed, repeatable read, serializable."
            ))),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Connection parameters after validation, ready for a driver.
#[derive(Clone, Serialize)]
pub struct ConnectionParams {
    pub engine: String,
    pub database: Option<String>,
    pub user: Option<String>,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub service: Option<String>,
    pub isolation_level: Option<IsolationLevel>,
    pub assume_role: Option<String>,
    pub server_side_binding: bool,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("engine", &self.engine)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("service", &self.service)
            .field("isolation_level", &self.isolation_level)
            .finish_non_exhaustive()
    }
}

impl ConnectionParams {
    /// Validate an alias's settings and resolve them into driver parameters.
    pub fn from_settings(settings: &DatabaseSettings) -> DbResult<Self> {
        let engine = settings.engine_name().to_string();
        let name = settings.name.clone().filter(|n| !n.is_empty());
        let service = settings.options.service.clone();

        if name.is_none() && service.is_none() {
            return Err(DbError::improperly_configured(
                "settings.DATABASES is improperly configured. \
                 Please supply the NAME or OPTIONS['service'] value.",
            ));
        }
        if engine == "postgresql" {
            if let Some(name) = &name {
                let len = name.chars().count();
                if len > MAX_NAME_LENGTH {
                    return Err(DbError::improperly_configured(format!(
                        "The database name '{name}' ({len} characters) is longer than \
                         PostgreSQL's limit of {MAX_NAME_LENGTH} characters. Supply a \
                         shorter NAME in settings.DATABASES."
                    )));
                }
            }
        }

        let isolation_level = settings
            .options
            .isolation_level
            .as_deref()
            .map(IsolationLevel::parse)
            .transpose()?;

        Ok(Self {
            engine,
            database: name,
            user: settings.user.clone(),
            password: settings.password.clone(),
            host: settings.host.clone().filter(|h| !h.is_empty()),
            port: settings.port,
            service,
            isolation_level,
            assume_role: settings.options.assume_role.clone(),
            server_side_binding: settings.options.server_side_binding.unwrap_or(false),
            extra: settings.options.extra.clone(),
        })
    }

    /// The database name, or an empty string when a service stands in.
    pub fn database_name(&self) -> &str {
        self.database.as_deref().unwrap_or("")
    }
}
