//! One database connection and its transaction state.
//!
//! A [`ConnectionHandle`] wraps at most one physical connection (direct or
//! leased from a pool) for a single alias and execution model. It connects
//! lazily, tracks autocommit and atomic-block state, hands out savepoint ids,
//! queues `on_commit` hooks and keeps the query log.
//!
//! Every async method takes `&mut self`: a handle has exactly one owner at a
//! time, and suspendable code shares one only behind an async mutex.

use crate::config::{DatabaseSettings, QUERY_LOG_LIMIT};
use crate::db::driver::{Driver, DriverConnection, DriverFeatures, Row};
use crate::db::handler::ConnectionHandler;
use crate::db::pool::PooledConnection;
use crate::db::session::ConnectionConfigurer;
use crate::error::{DatabaseErrorKind, DbError, DbResult};
use crate::models::{ConnectionParams, ExecutionModel};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Record of an active atomic block; the handle never owns the block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMarker {
    pub durable: bool,
    pub from_testcase: bool,
}

/// One statement in the query log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub sql: String,
    pub duration: Duration,
}

type CommitHook = Box<dyn FnOnce() -> DbResult<()> + Send>;

struct PendingHook {
    /// Savepoints active when the hook was registered.
    sids: Vec<String>,
    func: CommitHook,
    robust: bool,
}

enum Lease {
    Direct(Box<dyn DriverConnection>),
    Pooled(PooledConnection),
}

impl Lease {
    fn connection(&mut self) -> DbResult<&mut dyn DriverConnection> {
        match self {
            Lease::Direct(conn) => {
                let conn: &mut dyn DriverConnection = conn.as_mut();
                Ok(conn)
            }
            Lease::Pooled(lease) => lease.connection(),
        }
    }

    async fn close(self) -> DbResult<()> {
        match self {
            Lease::Direct(mut conn) => conn.close().await,
            Lease::Pooled(lease) => {
                lease.release().await;
                Ok(())
            }
        }
    }
}

pub struct ConnectionHandle {
    alias: String,
    model: ExecutionModel,
    handler: ConnectionHandler,
    settings: DatabaseSettings,
    driver: Arc<dyn Driver>,
    features: DriverFeatures,
    connection: Option<Lease>,

    pub(crate) autocommit: bool,
    pub(crate) in_atomic_block: bool,
    pub(crate) needs_rollback: bool,
    pub(crate) rollback_cause: Option<String>,
    pub(crate) savepoint_ids: Vec<Option<String>>,
    pub(crate) atomic_blocks: Vec<BlockMarker>,
    pub(crate) commit_on_exit: bool,
    pub(crate) closed_in_transaction: bool,
    pub(crate) atomic_depth: usize,

    savepoint_state: u32,
    savepoint_tag: String,
    close_at: Option<Instant>,
    errors_occurred: bool,
    health_check_enabled: bool,
    health_check_done: bool,

    run_on_commit: Vec<PendingHook>,
    run_commit_hooks_on_set_autocommit_on: bool,

    queries_log: VecDeque<QueryRecord>,
    force_debug_cursor: bool,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("alias", &self.alias)
            .field("model", &self.model)
            .field("vendor", &self.driver.vendor())
            .field("connected", &self.connection.is_some())
            .field("autocommit", &self.autocommit)
            .field("in_atomic_block", &self.in_atomic_block)
            .field("needs_rollback", &self.needs_rollback)
            .field("savepoint_ids", &self.savepoint_ids)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(
        handler: ConnectionHandler,
        alias: &str,
        model: ExecutionModel,
    ) -> DbResult<Self> {
        let settings = handler.database(alias)?.clone();
        let driver = handler.driver_for(alias)?;
        let features = driver.features();
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            alias: alias.to_string(),
            model,
            handler,
            settings,
            driver,
            features,
            connection: None,
            autocommit: false,
            in_atomic_block: false,
            needs_rollback: false,
            rollback_cause: None,
            savepoint_ids: Vec::new(),
            atomic_blocks: Vec::new(),
            commit_on_exit: true,
            closed_in_transaction: false,
            atomic_depth: 0,
            savepoint_state: 0,
            savepoint_tag: tag[..8].to_string(),
            close_at: None,
            errors_occurred: false,
            health_check_enabled: false,
            health_check_done: false,
            run_on_commit: Vec::new(),
            run_commit_hooks_on_set_autocommit_on: false,
            queries_log: VecDeque::new(),
            force_debug_cursor: false,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn model(&self) -> ExecutionModel {
        self.model
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn features(&self) -> DriverFeatures {
        self.features
    }

    pub fn vendor(&self) -> &'static str {
        self.driver.vendor()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.connection, Some(Lease::Pooled(_)))
    }

    pub fn in_atomic_block(&self) -> bool {
        self.in_atomic_block
    }

    pub fn needs_rollback(&self) -> bool {
        self.needs_rollback
    }

    pub fn rollback_cause(&self) -> Option<&str> {
        self.rollback_cause.as_deref()
    }

    pub fn savepoint_ids(&self) -> &[Option<String>] {
        &self.savepoint_ids
    }

    pub fn atomic_blocks(&self) -> &[BlockMarker] {
        &self.atomic_blocks
    }

    pub fn commit_on_exit(&self) -> bool {
        self.commit_on_exit
    }

    pub fn closed_in_transaction(&self) -> bool {
        self.closed_in_transaction
    }

    /// Number of atomic blocks currently entered on this handle.
    pub fn atomic_depth(&self) -> usize {
        self.atomic_depth
    }

    pub fn errors_occurred(&self) -> bool {
        self.errors_occurred
    }

    pub fn pending_commit_hooks(&self) -> usize {
        self.run_on_commit.len()
    }

    fn raw(&mut self) -> DbResult<&mut dyn DriverConnection> {
        match self.connection.as_mut() {
            Some(lease) => lease.connection(),
            None => Err(DbError::database(
                DatabaseErrorKind::Interface,
                "connection already closed",
                None,
            )),
        }
    }

    /// Note driver errors that leave the connection in doubt.
    fn track(&mut self, err: DbError) -> DbError {
        if err.marks_connection_unusable() {
            self.errors_occurred = true;
        }
        err
    }

    fn check_settings(&self) -> DbResult<()> {
        if self.settings.time_zone.is_some() && !self.handler.settings().use_tz {
            return Err(DbError::improperly_configured(format!(
                "Connection '{}' cannot set TIME_ZONE because USE_TZ is False.",
                self.alias
            )));
        }
        Ok(())
    }

    /// Open a new physical connection, replacing any state of the old one.
    pub async fn connect(&mut self) -> DbResult<()> {
        self.check_settings()?;
        self.in_atomic_block = false;
        self.savepoint_ids.clear();
        self.atomic_blocks.clear();
        self.needs_rollback = false;
        self.rollback_cause = None;
        self.close_at = self.settings.max_age().map(|age| Instant::now() + age);
        self.closed_in_transaction = false;
        self.errors_occurred = false;
        self.health_check_enabled = self.settings.conn_health_checks;
        // New connections are healthy.
        self.health_check_done = true;

        let params = ConnectionParams::from_settings(&self.settings)?;
        let lease = match self.handler.pool(&self.alias, self.model).await? {
            Some(pool) => Lease::Pooled(pool.acquire().await?),
            None => Lease::Direct(self.driver.connect(&params).await?),
        };
        self.connection = Some(lease);

        let autocommit = self.settings.autocommit;
        self.apply_autocommit(autocommit, false).await?;
        self.init_connection_state().await?;

        let alias = self.alias.clone();
        let model = self.model;
        let signals = self.handler.signals().clone();
        signals
            .send_connection_created(&alias, model, self.raw()?)
            .await?;
        self.run_on_commit.clear();

        info!(
            alias = %self.alias,
            model = %self.model,
            vendor = %self.driver.vendor(),
            pooled = self.is_pooled(),
            "Connected"
        );
        Ok(())
    }

    async fn init_connection_state(&mut self) -> DbResult<()> {
        if self.is_pooled() {
            return Ok(());
        }
        let setup = self.handler.session_setup(&self.alias)?;
        let commit = setup.configure(self.raw()?).await?;
        if commit && !self.autocommit {
            self.raw()?.commit().await?;
        }
        Ok(())
    }

    /// Connect if there is no connection yet.
    pub async fn ensure_connection(&mut self) -> DbResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if self.in_atomic_block && self.closed_in_transaction {
            return Err(DbError::database(
                DatabaseErrorKind::Programming,
                "Cannot open a new connection in an atomic block.",
                None,
            ));
        }
        self.connect().await
    }

    /// Close the connection. Inside an atomic block the block is marked for
    /// rollback and the handle refuses to reconnect until the block exits.
    pub async fn close(&mut self) -> DbResult<()> {
        self.run_on_commit.clear();
        if self.closed_in_transaction {
            return Ok(());
        }
        let Some(lease) = self.connection.take() else {
            return Ok(());
        };
        let result = lease.close().await;
        if self.in_atomic_block {
            self.closed_in_transaction = true;
            self.needs_rollback = true;
        }
        info!(alias = %self.alias, model = %self.model, "Closed connection");
        result
    }

    /// Probe the connection with a trivial query. Never fails.
    pub async fn is_usable(&mut self) -> bool {
        match self.raw() {
            Ok(conn) => conn.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Probe once per request when health checks are enabled; close the
    /// connection if the probe fails. Pools check their own connections.
    pub async fn close_if_health_check_failed(&mut self) -> DbResult<()> {
        if self.is_pooled() {
            return Ok(());
        }
        if self.connection.is_none() || !self.health_check_enabled || self.health_check_done {
            return Ok(());
        }
        if !self.is_usable().await {
            debug!(alias = %self.alias, "Health check failed, closing connection");
            self.close().await?;
        }
        self.health_check_done = true;
        Ok(())
    }

    /// Close the connection when it can't be reused for the next request.
    pub async fn close_if_unusable_or_obsolete(&mut self) -> DbResult<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        self.health_check_done = false;

        if self.get_autocommit().await? != self.settings.autocommit {
            return self.close().await;
        }

        if self.errors_occurred {
            if self.is_usable().await {
                self.errors_occurred = false;
                self.health_check_done = true;
            } else {
                return self.close().await;
            }
        }

        if self.close_at.is_some_and(|at| Instant::now() >= at) {
            return self.close().await;
        }
        Ok(())
    }

    pub async fn get_autocommit(&mut self) -> DbResult<bool> {
        self.ensure_connection().await?;
        Ok(self.autocommit)
    }

    /// Switch autocommit. With `force_begin` on a backend that opens
    /// transactions explicitly, disabling autocommit issues a `BEGIN` instead.
    pub async fn set_autocommit(&mut self, autocommit: bool, force_begin: bool) -> DbResult<()> {
        self.validate_no_atomic_block()?;
        self.close_if_health_check_failed().await?;
        self.ensure_connection().await?;
        self.apply_autocommit(autocommit, force_begin).await
    }

    async fn apply_autocommit(&mut self, autocommit: bool, force_begin: bool) -> DbResult<()> {
        let begin = force_begin && !autocommit && self.features.start_transaction_under_autocommit;
        let result = if begin {
            self.raw()?.begin().await
        } else {
            self.raw()?.set_autocommit(autocommit).await
        };
        result.map_err(|e| self.track(e))?;
        self.autocommit = autocommit;

        if autocommit && self.run_commit_hooks_on_set_autocommit_on {
            self.run_commit_hooks_on_set_autocommit_on = false;
            self.run_and_clear_commit_hooks()?;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.validate_no_atomic_block()?;
        if let Some(lease) = self.connection.as_mut() {
            let result = lease.connection()?.commit().await;
            result.map_err(|e| self.track(e))?;
            debug!(alias = %self.alias, "Committed");
        }
        self.errors_occurred = false;
        self.run_commit_hooks_on_set_autocommit_on = true;
        Ok(())
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.validate_no_atomic_block()?;
        if let Some(lease) = self.connection.as_mut() {
            let result = lease.connection()?.rollback().await;
            result.map_err(|e| self.track(e))?;
            debug!(alias = %self.alias, "Rolled back");
        }
        self.errors_occurred = false;
        self.needs_rollback = false;
        self.run_on_commit.clear();
        Ok(())
    }

    async fn savepoint_allowed(&mut self) -> DbResult<bool> {
        Ok(self.features.uses_savepoints && !self.get_autocommit().await?)
    }

    /// Create a savepoint inside the current transaction. Returns `None` when
    /// savepoints aren't allowed: in autocommit mode or without backend support.
    pub async fn savepoint(&mut self) -> DbResult<Option<String>> {
        if !self.savepoint_allowed().await? {
            return Ok(None);
        }
        self.savepoint_state += 1;
        let sid = format!("s{}_x{}", self.savepoint_tag, self.savepoint_state);
        let result = self.raw()?.savepoint(&sid).await;
        result.map_err(|e| self.track(e))?;
        debug!(alias = %self.alias, savepoint = %sid, "Created savepoint");
        Ok(Some(sid))
    }

    /// Roll back to `sid`. Commit hooks registered while it was active are
    /// discarded.
    pub async fn savepoint_rollback(&mut self, sid: &str) -> DbResult<()> {
        if !self.savepoint_allowed().await? {
            return Ok(());
        }
        let result = self.raw()?.rollback_to_savepoint(sid).await;
        result.map_err(|e| self.track(e))?;
        self.run_on_commit
            .retain(|hook| !hook.sids.iter().any(|s| s == sid));
        debug!(alias = %self.alias, savepoint = %sid, "Rolled back to savepoint");
        Ok(())
    }

    /// Release `sid`, when the backend can release savepoints.
    pub async fn savepoint_commit(&mut self, sid: &str) -> DbResult<()> {
        if !self.savepoint_allowed().await? {
            return Ok(());
        }
        if self.features.can_release_savepoints {
            let result = self.raw()?.release_savepoint(sid).await;
            result.map_err(|e| self.track(e))?;
            debug!(alias = %self.alias, savepoint = %sid, "Released savepoint");
        }
        Ok(())
    }

    /// Reset the savepoint counter.
    pub fn clean_savepoints(&mut self) {
        self.savepoint_state = 0;
    }

    pub fn get_rollback(&self) -> DbResult<bool> {
        if !self.in_atomic_block {
            return Err(DbError::transaction_management(
                "The rollback flag doesn't work outside of an 'atomic' block.",
            ));
        }
        Ok(self.needs_rollback)
    }

    /// Force (or cancel) a rollback when the innermost atomic block exits.
    pub fn set_rollback(&mut self, rollback: bool) -> DbResult<()> {
        if !self.in_atomic_block {
            return Err(DbError::transaction_management(
                "The rollback flag doesn't work outside of an 'atomic' block.",
            ));
        }
        self.needs_rollback = rollback;
        Ok(())
    }

    /// Mark the current atomic block for rollback because of `cause`.
    pub fn mark_for_rollback(&mut self, cause: impl std::fmt::Display) {
        if self.in_atomic_block {
            self.needs_rollback = true;
            self.rollback_cause = Some(cause.to_string());
        }
    }

    pub fn validate_no_atomic_block(&self) -> DbResult<()> {
        if self.in_atomic_block {
            return Err(DbError::transaction_management(
                "This is forbidden when an 'atomic' block is active.",
            ));
        }
        Ok(())
    }

    pub fn validate_no_broken_transaction(&self) -> DbResult<()> {
        if !self.needs_rollback {
            return Ok(());
        }
        let mut message = "An error occurred in the current transaction. You can't execute \
                           queries until the end of the 'atomic' block."
            .to_string();
        if let Some(cause) = &self.rollback_cause {
            message.push_str(&format!(" (caused by: {cause})"));
        }
        Err(DbError::transaction_management(message))
    }

    /// Run `func` once the current transaction commits. Outside an atomic
    /// block in autocommit mode it runs right away. A robust hook's failure is
    /// logged instead of returned.
    pub async fn on_commit<F>(&mut self, func: F, robust: bool) -> DbResult<()>
    where
        F: FnOnce() -> DbResult<()> + Send + 'static,
    {
        if self.in_atomic_block {
            let sids = self.savepoint_ids.iter().flatten().cloned().collect();
            self.run_on_commit.push(PendingHook {
                sids,
                func: Box::new(func),
                robust,
            });
            return Ok(());
        }
        if !self.get_autocommit().await? {
            return Err(DbError::transaction_management(
                "on_commit() cannot be used in manual transaction management",
            ));
        }
        Self::call_hook(&self.alias, Box::new(func), robust)
    }

    fn call_hook(alias: &str, func: CommitHook, robust: bool) -> DbResult<()> {
        match func() {
            Err(e) if robust => {
                error!(alias = %alias, error = %e, "Error calling on_commit() hook");
                Ok(())
            }
            other => other,
        }
    }

    /// Run queued commit hooks in registration order.
    pub fn run_and_clear_commit_hooks(&mut self) -> DbResult<()> {
        self.validate_no_atomic_block()?;
        let hooks = std::mem::take(&mut self.run_on_commit);
        for hook in hooks {
            Self::call_hook(&self.alias, hook.func, hook.robust)?;
        }
        Ok(())
    }

    async fn prepare_statement(&mut self) -> DbResult<()> {
        self.close_if_health_check_failed().await?;
        self.ensure_connection().await?;
        self.validate_no_broken_transaction()
    }

    pub fn queries_logged(&self) -> bool {
        self.force_debug_cursor || self.handler.settings().debug
    }

    pub fn set_force_debug_cursor(&mut self, force: bool) {
        self.force_debug_cursor = force;
    }

    fn log_query(&mut self, sql: &str, duration: Duration) {
        if !self.queries_logged() {
            return;
        }
        if self.queries_log.len() == QUERY_LOG_LIMIT {
            self.queries_log.pop_front();
        }
        self.queries_log.push_back(QueryRecord {
            sql: sql.to_string(),
            duration,
        });
        debug!(alias = %self.alias, duration_ms = duration.as_millis() as u64, sql = %sql, "Executed");
    }

    /// Statements recorded while query logging was on, oldest first.
    pub fn queries(&self) -> impl Iterator<Item = &QueryRecord> {
        self.queries_log.iter()
    }

    pub fn reset_queries(&mut self) {
        self.queries_log.clear();
    }

    /// Run a statement, connecting first if needed.
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.prepare_statement().await?;
        let start = Instant::now();
        let result = self.raw()?.execute(sql).await;
        self.log_query(sql, start.elapsed());
        result.map_err(|e| self.track(e))
    }

    pub async fn fetch_all(&mut self, sql: &str) -> DbResult<Vec<Row>> {
        self.prepare_statement().await?;
        let start = Instant::now();
        let result = self.raw()?.fetch_all(sql).await;
        self.log_query(sql, start.elapsed());
        result.map_err(|e| self.track(e))
    }

    /// Close this alias's pool so new connections pick up the configured time
    /// zone, then set it on the current connection. Returns whether the
    /// current connection changed.
    pub async fn ensure_timezone(&mut self) -> DbResult<bool> {
        self.close_pool().await;
        if self.connection.is_none() {
            return Ok(false);
        }
        let setup = self.handler.session_setup(&self.alias)?;
        setup.configure_time_zone(self.raw()?).await
    }

    /// Close the pool of this alias and model, if there is one.
    pub async fn close_pool(&mut self) -> bool {
        self.handler.close_pool(&self.alias, self.model).await
    }
}
