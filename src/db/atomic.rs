//! Atomic blocks.
//!
//! An [`Atomic`] describes a block of work that commits as a unit: the
//! outermost block opens a transaction, nested blocks use savepoints. The same
//! value may be entered any number of times, nested or not; all state lives on
//! the [`ConnectionHandle`].
//!
//! Entry and exit are async. Blocking callers use [`Atomic::run_blocking`],
//! which drives them to completion on the calling thread; suspendable callers
//! use [`Atomic::run`], which also survives being cancelled mid-block.

use crate::db::async_connection::AsyncConnection;
use crate::db::bridge::block_on;
use crate::db::handle::{BlockMarker, ConnectionHandle};
use crate::error::{DbError, DbResult};
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// How the body of an atomic block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    /// The block's future was dropped before it finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atomic {
    alias: String,
    savepoint: bool,
    durable: bool,
    from_testcase: bool,
}

/// An atomic block on `alias` that uses savepoints when nested.
pub fn atomic(alias: impl Into<String>) -> Atomic {
    Atomic::new(alias)
}

impl Atomic {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            savepoint: true,
            durable: false,
            from_testcase: false,
        }
    }

    /// Whether a nested entry creates a savepoint. Without one, a failure in
    /// the nested block dooms the enclosing transaction.
    pub fn savepoint(mut self, savepoint: bool) -> Self {
        self.savepoint = savepoint;
        self
    }

    /// A durable block must be the outermost one, so its changes are
    /// committed when it exits.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Mark the block as a test-case wrapper. Durable blocks may nest inside.
    pub fn for_test_case(mut self) -> Self {
        self.from_testcase = true;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn uses_savepoint(&self) -> bool {
        self.savepoint
    }

    fn marker(&self) -> BlockMarker {
        BlockMarker {
            durable: self.durable,
            from_testcase: self.from_testcase,
        }
    }

    /// Enter the block on `conn`.
    pub async fn enter(&self, conn: &mut ConnectionHandle) -> DbResult<()> {
        conn.atomic_depth += 1;
        let result = self.enter_inner(conn).await;
        if result.is_err() {
            conn.atomic_depth = conn.atomic_depth.saturating_sub(1);
        }
        result
    }

    async fn enter_inner(&self, conn: &mut ConnectionHandle) -> DbResult<()> {
        if self.durable && conn.atomic_blocks.last().is_some_and(|b| !b.from_testcase) {
            return Err(DbError::NestedDurable);
        }

        if !conn.in_atomic_block {
            conn.commit_on_exit = true;
            conn.needs_rollback = false;
            conn.rollback_cause = None;
            // Already in manual-commit mode: join the existing transaction.
            if !conn.get_autocommit().await? {
                conn.in_atomic_block = true;
                conn.commit_on_exit = false;
            }
        }

        if conn.in_atomic_block {
            let sid = if self.savepoint && !conn.needs_rollback {
                conn.savepoint().await?
            } else {
                None
            };
            conn.savepoint_ids.push(sid);
        } else {
            conn.set_autocommit(false, true).await?;
            conn.in_atomic_block = true;
        }

        conn.atomic_blocks.push(self.marker());
        debug!(
            alias = %self.alias,
            depth = conn.atomic_depth,
            savepoint = ?conn.savepoint_ids.last().cloned().flatten(),
            "Entered atomic block"
        );
        Ok(())
    }

    /// Leave the block, committing or rolling back according to `outcome`
    /// and the handle's rollback flag.
    pub async fn exit(&self, conn: &mut ConnectionHandle, outcome: Outcome) -> DbResult<()> {
        conn.atomic_depth = conn.atomic_depth.saturating_sub(1);
        conn.atomic_blocks.pop();

        let sid = match conn.savepoint_ids.pop() {
            Some(sid) => sid,
            None => {
                // Outermost block: leave the atomic state before committing.
                conn.in_atomic_block = false;
                None
            }
        };

        if outcome == Outcome::Cancelled {
            debug!(alias = %self.alias, "Atomic block cancelled, rolling back");
        }
        let result = self.finish(conn, sid, outcome == Outcome::Success).await;

        match (result, Self::restore(conn).await) {
            (Err(e), Err(restore)) => {
                warn!(alias = %self.alias, error = %restore, "Failed to restore connection state");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn finish(
        &self,
        conn: &mut ConnectionHandle,
        sid: Option<String>,
        succeeded: bool,
    ) -> DbResult<()> {
        if conn.closed_in_transaction {
            // The connection is gone; the transaction died with it.
            return Ok(());
        }

        if succeeded && !conn.needs_rollback {
            if conn.in_atomic_block {
                let Some(sid) = sid else {
                    return Ok(());
                };
                if let Err(e) = conn.savepoint_commit(&sid).await {
                    if e.is_database_error() {
                        let undo = match conn.savepoint_rollback(&sid).await {
                            Ok(()) => conn.savepoint_commit(&sid).await,
                            Err(undo) => Err(undo),
                        };
                        if undo.is_err() {
                            conn.needs_rollback = true;
                        }
                    }
                    return Err(e);
                }
            } else if let Err(e) = conn.commit().await {
                if e.is_database_error() {
                    if let Err(rollback) = conn.rollback().await {
                        warn!(
                            alias = %self.alias,
                            error = %rollback,
                            "Rollback after failed commit failed, closing connection"
                        );
                        Self::poison(conn, &self.alias).await;
                    }
                }
                return Err(e);
            }
            return Ok(());
        }

        conn.needs_rollback = false;
        if conn.in_atomic_block {
            match sid {
                None => conn.needs_rollback = true,
                Some(sid) => {
                    if let Err(e) = conn.savepoint_rollback(&sid).await {
                        debug!(alias = %self.alias, error = %e, "Rollback to savepoint failed");
                        conn.needs_rollback = true;
                        return Ok(());
                    }
                    // The interval is undone, but a savepoint that can't be
                    // released leaves the parent transaction in doubt.
                    if let Err(e) = conn.savepoint_commit(&sid).await {
                        debug!(alias = %self.alias, error = %e, "Release after rollback to savepoint failed");
                        conn.needs_rollback = true;
                        return Err(e);
                    }
                }
            }
        } else if let Err(e) = conn.rollback().await {
            warn!(
                alias = %self.alias,
                error = %e,
                "Rollback failed, closing connection"
            );
            Self::poison(conn, &self.alias).await;
        }
        Ok(())
    }

    /// Close a connection whose transaction state is unknown.
    async fn poison(conn: &mut ConnectionHandle, alias: &str) {
        if let Err(e) = conn.close().await {
            warn!(alias = %alias, error = %e, "Failed to close connection after failed rollback");
        }
    }

    /// Put the handle back into autocommit once the outermost block is done.
    async fn restore(conn: &mut ConnectionHandle) -> DbResult<()> {
        if !conn.in_atomic_block {
            if conn.closed_in_transaction || !conn.is_connected() {
                return Ok(());
            }
            return conn.set_autocommit(true, false).await;
        }
        if conn.savepoint_ids.is_empty() && !conn.commit_on_exit && !conn.closed_in_transaction {
            // Leaving the outermost block of a transaction we joined.
            conn.in_atomic_block = false;
        }
        Ok(())
    }

    /// Run `body` inside the block on a blocking handle.
    ///
    /// The body's error wins over any error raised while exiting. A panicking
    /// body takes the failure path and the panic is resumed afterwards.
    pub fn run_blocking<T, E, F>(&self, conn: &mut ConnectionHandle, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut ConnectionHandle) -> Result<T, E>,
        E: From<DbError>,
    {
        block_on(self.enter(conn))?;
        match catch_unwind(AssertUnwindSafe(|| body(&mut *conn))) {
            Ok(Ok(value)) => {
                block_on(self.exit(conn, Outcome::Success))?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(exit) = block_on(self.exit(conn, Outcome::Failed)) {
                    warn!(alias = %self.alias, error = %exit, "Error while exiting failed atomic block");
                }
                Err(e)
            }
            Err(panic) => {
                let _ = block_on(self.exit(conn, Outcome::Failed));
                resume_unwind(panic)
            }
        }
    }

    /// Run `body` inside the block on a shared suspendable connection.
    ///
    /// Entry and exit hold the connection's gate and run to completion even
    /// if this future is dropped; a block dropped after entry is rolled back
    /// before the connection is next used.
    pub async fn run<T, E, F, Fut>(&self, conn: &AsyncConnection, body: F) -> Result<T, E>
    where
        F: FnOnce(AsyncConnection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let mut guard = CancelGuard::new(conn.clone(), self.clone());

        let enter = {
            let conn = conn.clone();
            let atomic = self.clone();
            let state = Arc::clone(&guard.state);
            detach(async move {
                let mut handle = conn.lock().await;
                atomic.enter(&mut handle).await?;
                if state
                    .compare_exchange(ENTERING, ENTERED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Dropped while entering: nobody will run the body.
                    atomic.exit(&mut handle, Outcome::Cancelled).await?;
                }
                Ok(())
            })
        };
        if let Err(e) = enter.await {
            guard.disarm();
            return Err(e.into());
        }

        let result = body(conn.clone()).await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failed
        };

        let exit = {
            let conn = conn.clone();
            let atomic = self.clone();
            detach(async move {
                let mut handle = conn.lock().await;
                atomic.exit(&mut handle, outcome).await
            })
        };
        guard.disarm();

        match (result, exit.await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), exit) => {
                if let Err(exit) = exit {
                    warn!(alias = %self.alias, error = %exit, "Error while exiting failed atomic block");
                }
                Err(e)
            }
        }
    }
}

const ENTERING: u8 = 0;
const ENTERED: u8 = 1;
const CANCELLED: u8 = 2;

/// Schedules the exit of a block whose future was dropped.
struct CancelGuard {
    state: Arc<AtomicU8>,
    conn: AsyncConnection,
    atomic: Atomic,
    armed: bool,
}

impl CancelGuard {
    fn new(conn: AsyncConnection, atomic: Atomic) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ENTERING)),
            conn,
            atomic,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self
            .state
            .compare_exchange(ENTERING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            // The entering task sees the flag and exits the block itself.
            Ok(_) => {}
            Err(ENTERED) => self.conn.schedule_exit(self.atomic.clone()),
            Err(_) => {}
        }
    }
}

/// Run `fut` as its own task when a runtime is available, so it completes
/// even if the returned future is dropped.
fn detach<T>(fut: impl Future<Output = DbResult<T>> + Send + 'static) -> BoxFuture<'static, DbResult<T>>
where
    T: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(fut);
            Box::pin(async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => resume_unwind(e.into_panic()),
                    Err(e) => Err(DbError::internal(format!("atomic block task failed: {e}"))),
                }
            })
        }
        Err(_) => Box::pin(fut),
    }
}

/// Run `body`; if it fails inside an atomic block, mark the block for
/// rollback without opening a transaction of its own.
pub fn mark_for_rollback_on_error<T, E, F>(conn: &mut ConnectionHandle, body: F) -> Result<T, E>
where
    F: FnOnce(&mut ConnectionHandle) -> Result<T, E>,
    E: std::fmt::Display,
{
    let result = body(&mut *conn);
    if let Err(e) = &result {
        conn.mark_for_rollback(e);
    }
    result
}

/// Suspendable variant of [`mark_for_rollback_on_error`].
pub async fn mark_for_rollback_on_error_async<T, E, Fut>(
    conn: &AsyncConnection,
    fut: Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let result = fut.await;
    if let Err(e) = &result {
        conn.lock().await.mark_for_rollback(e);
    }
    result
}
