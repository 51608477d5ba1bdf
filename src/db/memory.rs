//! In-process driver that journals statements instead of running them.
//!
//! Committed statements land in a shared [`MemoryDatabase`]; each connection
//! keeps its own pending journal with savepoint marks, so rollbacks and
//! savepoint rollbacks behave like a real transactional backend. Every driver
//! call is recorded in an operation log, and failures can be injected at any
//! [`FaultPoint`].

use crate::db::driver::{Driver, DriverConnection, DriverFeatures, Row};
use crate::error::{DatabaseErrorKind, DbError, DbResult};
use crate::models::ConnectionParams;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    Connect,
    SetAutocommit(bool),
    Begin,
    Execute(String),
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    Ping,
    Close,
}

/// Driver calls where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Connect,
    SetAutocommit,
    Begin,
    Execute,
    Commit,
    Rollback,
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
    Ping,
    Close,
}

#[derive(Debug)]
struct Fault {
    remaining: usize,
    error: DbError,
}

#[derive(Debug)]
struct MemoryState {
    committed: Vec<String>,
    ops: Vec<DriverOp>,
    faults: HashMap<FaultPoint, Fault>,
    connections_opened: usize,
    open_connections: usize,
    server_time_zone: String,
}

/// A named in-memory database shared by all of its connections.
#[derive(Debug)]
pub struct MemoryDatabase {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                committed: Vec::new(),
                ops: Vec::new(),
                faults: HashMap::new(),
                connections_opened: 0,
                open_connections: 0,
                server_time_zone: "UTC".to_string(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail the next call at `point` with an operational error.
    pub fn fail_next(&self, point: FaultPoint) {
        self.fail_with(
            point,
            1,
            DbError::operational(format!("injected failure at {point:?}")),
        );
    }

    /// Fail every call at `point` until faults are cleared.
    pub fn fail_always(&self, point: FaultPoint) {
        self.fail_with(
            point,
            usize::MAX,
            DbError::operational(format!("injected failure at {point:?}")),
        );
    }

    /// Fail the next `times` calls at `point` with `error`.
    pub fn fail_with(&self, point: FaultPoint, times: usize, error: DbError) {
        self.state().faults.insert(
            point,
            Fault {
                remaining: times,
                error,
            },
        );
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Time zone new connections start in.
    pub fn set_server_time_zone(&self, tz: impl Into<String>) {
        self.state().server_time_zone = tz.into();
    }

    /// Statements made durable by a commit (or run in autocommit mode).
    pub fn committed(&self) -> Vec<String> {
        self.state().committed.clone()
    }

    /// Committed statements starting with `prefix` (case-insensitive).
    pub fn count_committed(&self, prefix: &str) -> usize {
        let prefix = prefix.to_ascii_uppercase();
        self.state()
            .committed
            .iter()
            .filter(|s| s.to_ascii_uppercase().starts_with(&prefix))
            .count()
    }

    /// Every driver call recorded so far.
    pub fn ops(&self) -> Vec<DriverOp> {
        self.state().ops.clone()
    }

    /// Recorded calls excluding statements, connects and pings.
    pub fn transaction_ops(&self) -> Vec<DriverOp> {
        self.state()
            .ops
            .iter()
            .filter(|op| {
                !matches!(
                    op,
                    DriverOp::Execute(_) | DriverOp::Connect | DriverOp::Ping
                )
            })
            .cloned()
            .collect()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }

    /// Record `op` and apply any fault registered for `point`.
    fn record(&self, op: DriverOp, point: FaultPoint) -> DbResult<()> {
        let mut state = self.state();
        state.ops.push(op);
        if let Some(fault) = state.faults.get_mut(&point) {
            let error = fault.error.clone();
            if fault.remaining != usize::MAX {
                fault.remaining -= 1;
            }
            if fault.remaining == 0 {
                state.faults.remove(&point);
            }
            return Err(error);
        }
        Ok(())
    }
}

/// A session against a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    autocommit: bool,
    in_transaction: bool,
    pending: Vec<String>,
    savepoints: Vec<(String, usize)>,
    time_zone: String,
    closed: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::database(
                DatabaseErrorKind::Interface,
                "connection already closed",
                None,
            ));
        }
        Ok(())
    }

    fn implicit_begin(&mut self) {
        if !self.autocommit && !self.in_transaction {
            self.db.state().ops.push(DriverOp::Begin);
            self.in_transaction = true;
        }
    }

    fn finish_transaction(&mut self, commit: bool) {
        if commit && !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.db.state().committed.extend(pending);
        }
        self.pending.clear();
        self.savepoints.clear();
        self.in_transaction = false;
    }

    fn savepoint_position(&self, sid: &str) -> DbResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(name, _)| name == sid)
            .ok_or_else(|| {
                DbError::database(
                    DatabaseErrorKind::Operational,
                    format!("savepoint \"{sid}\" does not exist"),
                    Some("3B001".to_string()),
                )
            })
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.check_open()?;
        self.implicit_begin();
        self.db
            .record(DriverOp::Execute(sql.to_string()), FaultPoint::Execute)?;

        if let Some(tz) = sql
            .strip_prefix("SET TIME ZONE '")
            .and_then(|rest| rest.strip_suffix('\''))
        {
            self.time_zone = tz.to_string();
        }

        if self.in_transaction {
            self.pending.push(sql.to_string());
        } else {
            self.db.state().committed.push(sql.to_string());
        }
        Ok(1)
    }

    async fn fetch_all(&mut self, sql: &str) -> DbResult<Vec<Row>> {
        self.check_open()?;
        self.implicit_begin();
        self.db
            .record(DriverOp::Execute(sql.to_string()), FaultPoint::Execute)?;
        if sql.trim().eq_ignore_ascii_case("SELECT 1") {
            let mut row = Row::new();
            row.insert("?column?".to_string(), serde_json::json!(1));
            return Ok(vec![row]);
        }
        Ok(Vec::new())
    }

    async fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()> {
        self.check_open()?;
        self.db
            .record(DriverOp::SetAutocommit(autocommit), FaultPoint::SetAutocommit)?;
        if autocommit && self.in_transaction {
            self.finish_transaction(true);
        }
        self.autocommit = autocommit;
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.check_open()?;
        self.db.record(DriverOp::Begin, FaultPoint::Begin)?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.check_open()?;
        self.db.record(DriverOp::Commit, FaultPoint::Commit)?;
        self.finish_transaction(true);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.check_open()?;
        self.db.record(DriverOp::Rollback, FaultPoint::Rollback)?;
        self.finish_transaction(false);
        Ok(())
    }

    async fn savepoint(&mut self, sid: &str) -> DbResult<()> {
        self.check_open()?;
        self.db
            .record(DriverOp::Savepoint(sid.to_string()), FaultPoint::Savepoint)?;
        self.in_transaction = true;
        self.savepoints.push((sid.to_string(), self.pending.len()));
        Ok(())
    }

    async fn release_savepoint(&mut self, sid: &str) -> DbResult<()> {
        self.check_open()?;
        self.db.record(
            DriverOp::ReleaseSavepoint(sid.to_string()),
            FaultPoint::ReleaseSavepoint,
        )?;
        let pos = self.savepoint_position(sid)?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, sid: &str) -> DbResult<()> {
        self.check_open()?;
        self.db.record(
            DriverOp::RollbackToSavepoint(sid.to_string()),
            FaultPoint::RollbackToSavepoint,
        )?;
        let pos = self.savepoint_position(sid)?;
        let mark = self.savepoints[pos].1;
        self.pending.truncate(mark);
        self.savepoints.truncate(pos + 1);
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.check_open()?;
        self.db.record(DriverOp::Ping, FaultPoint::Ping)
    }

    async fn time_zone(&mut self) -> DbResult<Option<String>> {
        self.check_open()?;
        Ok(Some(self.time_zone.clone()))
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.savepoints.clear();
        self.in_transaction = false;
        {
            let mut state = self.db.state();
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        self.db.record(DriverOp::Close, FaultPoint::Close)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            let mut state = self.db.state();
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

/// Driver for the `memory` engine. Databases are created on first use and
/// looked up by `NAME`.
#[derive(Debug)]
pub struct MemoryDriver {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
    features: DriverFeatures,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            features: DriverFeatures {
                supports_timezones: true,
                supports_roles: true,
                ..DriverFeatures::default()
            },
        }
    }

    pub fn with_features(mut self, features: DriverFeatures) -> Self {
        self.features = features;
        self
    }

    /// A driver whose connections refuse the suspendable model.
    pub fn blocking_only(mut self) -> Self {
        self.features.supports_async = false;
        self
    }

    pub fn without_savepoints(mut self) -> Self {
        self.features.uses_savepoints = false;
        self.features.can_release_savepoints = false;
        self
    }

    /// Open transactions with an explicit `BEGIN`, like SQLite.
    pub fn begin_under_autocommit(mut self) -> Self {
        self.features.start_transaction_under_autocommit = true;
        self
    }

    /// Get or create the database called `name`.
    pub fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        let mut databases = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            databases
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryDatabase::new(name))),
        )
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn vendor(&self) -> &'static str {
        "memory"
    }

    fn features(&self) -> DriverFeatures {
        self.features
    }

    async fn connect(&self, params: &ConnectionParams) -> DbResult<Box<dyn DriverConnection>> {
        let name = params
            .database
            .as_deref()
            .or(params.service.as_deref())
            .unwrap_or("memory");
        let db = self.database(name);
        db.record(DriverOp::Connect, FaultPoint::Connect)?;
        let time_zone = {
            let mut state = db.state();
            state.connections_opened += 1;
            state.open_connections += 1;
            state.server_time_zone.clone()
        };
        debug!(database = %name, "Opened memory connection");
        Ok(Box::new(MemoryConnection {
            db,
            autocommit: true,
            in_transaction: false,
            pending: Vec::new(),
            savepoints: Vec::new(),
            time_zone,
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;

    async fn connect(driver: &MemoryDriver) -> Box<dyn DriverConnection> {
        let params =
            ConnectionParams::from_settings(&DatabaseSettings::new("memory").with_name("t"))
                .unwrap();
        driver.connect(&params).await.unwrap()
    }

    #[tokio::test]
    async fn test_autocommit_statements_are_committed() {
        let driver = MemoryDriver::new();
        let mut conn = connect(&driver).await;
        conn.execute("INSERT 1").await.unwrap();
        assert_eq!(driver.database("t").committed(), vec!["INSERT 1"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_pending() {
        let driver = MemoryDriver::new();
        let mut conn = connect(&driver).await;
        conn.set_autocommit(false).await.unwrap();
        conn.execute("INSERT 1").await.unwrap();
        assert!(conn.in_transaction());
        conn.rollback().await.unwrap();
        assert!(driver.database("t").committed().is_empty());
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_savepoint_rollback_truncates_interval() {
        let driver = MemoryDriver::new();
        let db = driver.database("t");
        let mut conn = connect(&driver).await;
        conn.set_autocommit(false).await.unwrap();
        conn.execute("INSERT 1").await.unwrap();
        conn.savepoint("s1").await.unwrap();
        conn.execute("INSERT 2").await.unwrap();
        conn.rollback_to_savepoint("s1").await.unwrap();
        conn.release_savepoint("s1").await.unwrap();
        conn.commit().await.unwrap();
        assert_eq!(db.committed(), vec!["INSERT 1"]);
    }

    #[tokio::test]
    async fn test_release_unknown_savepoint_fails() {
        let driver = MemoryDriver::new();
        let mut conn = connect(&driver).await;
        let err = conn.release_savepoint("nope").await.unwrap_err();
        assert_eq!(err.sql_state(), Some("3B001"));
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let driver = MemoryDriver::new();
        let db = driver.database("t");
        let mut conn = connect(&driver).await;
        db.fail_next(FaultPoint::Ping);
        assert!(conn.ping().await.is_err());
        assert!(conn.ping().await.is_ok());
        assert_eq!(
            db.ops(),
            vec![DriverOp::Connect, DriverOp::Ping, DriverOp::Ping]
        );
    }

    #[tokio::test]
    async fn test_close_tracks_open_connections() {
        let driver = MemoryDriver::new();
        let db = driver.database("t");
        let mut conn = connect(&driver).await;
        assert_eq!(db.open_connections(), 1);
        conn.close().await.unwrap();
        assert_eq!(db.open_connections(), 0);
        assert!(conn.execute("INSERT 1").await.is_err());

        let second = connect(&driver).await;
        drop(second);
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_time_zone_follows_set_statement() {
        let driver = MemoryDriver::new();
        let mut conn = connect(&driver).await;
        assert_eq!(conn.time_zone().await.unwrap().as_deref(), Some("UTC"));
        let sql = driver.set_time_zone_sql("Europe/Paris").unwrap();
        conn.execute(&sql).await.unwrap();
        assert_eq!(
            conn.time_zone().await.unwrap().as_deref(),
            Some("Europe/Paris")
        );
    }
}
