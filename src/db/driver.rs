//! Driver contract consumed by the connection layer.
//!
//! A [`Driver`] opens physical connections for one engine; a
//! [`DriverConnection`] is one open session. Both are async. Blocking callers
//! drive them through [`crate::db::bridge::block_on`].

use crate::error::DbResult;
use crate::models::{ConnectionParams, IsolationLevel};
use async_trait::async_trait;

/// A result row keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Capabilities a driver reports to the transaction machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverFeatures {
    pub uses_savepoints: bool,
    pub can_release_savepoints: bool,
    /// Whether connections may be used from the suspendable model.
    pub supports_async: bool,
    /// Open transactions with an explicit `BEGIN` instead of switching the
    /// session out of autocommit.
    pub start_transaction_under_autocommit: bool,
    pub supports_timezones: bool,
    pub supports_roles: bool,
}

impl Default for DriverFeatures {
    fn default() -> Self {
        Self {
            uses_savepoints: true,
            can_release_savepoints: true,
            supports_async: true,
            start_transaction_under_autocommit: false,
            supports_timezones: false,
            supports_roles: false,
        }
    }
}

/// Quote an identifier with double quotes.
pub fn quote_name(name: &str) -> String {
    if name.starts_with('"') && name.ends_with('"') && name.len() > 1 {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// One open driver session.
#[async_trait]
pub trait DriverConnection: Send {
    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str) -> DbResult<u64>;

    /// Run a query and collect its rows.
    async fn fetch_all(&mut self, sql: &str) -> DbResult<Vec<Row>>;

    /// Switch the session in or out of autocommit.
    async fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()>;

    /// Explicitly open a transaction.
    async fn begin(&mut self) -> DbResult<()> {
        self.execute("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    async fn savepoint(&mut self, sid: &str) -> DbResult<()> {
        self.execute(&format!("SAVEPOINT {}", quote_name(sid)))
            .await
            .map(|_| ())
    }

    async fn release_savepoint(&mut self, sid: &str) -> DbResult<()> {
        self.execute(&format!("RELEASE SAVEPOINT {}", quote_name(sid)))
            .await
            .map(|_| ())
    }

    async fn rollback_to_savepoint(&mut self, sid: &str) -> DbResult<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", quote_name(sid)))
            .await
            .map(|_| ())
    }

    /// Trivial liveness probe.
    async fn ping(&mut self) -> DbResult<()> {
        self.fetch_all("SELECT 1").await.map(|_| ())
    }

    /// Session time zone as reported by the server, when the backend has one.
    async fn time_zone(&mut self) -> DbResult<Option<String>> {
        Ok(None)
    }

    /// Whether a transaction is currently open on the session.
    fn in_transaction(&self) -> bool;

    /// Whether the session has been closed.
    fn is_closed(&self) -> bool;

    /// Close the session. Further calls fail.
    async fn close(&mut self) -> DbResult<()>;
}

/// Opens connections for one engine.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short vendor name used in logs.
    fn vendor(&self) -> &'static str;

    fn features(&self) -> DriverFeatures;

    async fn connect(&self, params: &ConnectionParams) -> DbResult<Box<dyn DriverConnection>>;

    /// Statement that sets the session time zone, if supported.
    fn set_time_zone_sql(&self, time_zone: &str) -> Option<String> {
        self.features()
            .supports_timezones
            .then(|| format!("SET TIME ZONE '{}'", time_zone.replace('\'', "''")))
    }

    /// Statement that switches the session role, if supported.
    fn set_role_sql(&self, role: &str) -> Option<String> {
        self.features()
            .supports_roles
            .then(|| format!("SET ROLE {}", quote_name(role)))
    }

    /// Statement that sets the default isolation level for the session.
    fn isolation_level_sql(&self, level: IsolationLevel) -> Option<String> {
        Some(format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))
    }
}
